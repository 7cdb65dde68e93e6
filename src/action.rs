use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the only tool the model may invoke.
pub const COMPUTER_TOOL_NAME: &str = "computer";

/// Tool type understood by the computer-use beta.
pub const COMPUTER_TOOL_TYPE: &str = "computer_20241022";

/// Screen position as sent by the model, `[x, y]` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate(pub i32, pub i32);

impl Coordinate {
    pub fn x(&self) -> i32 {
        self.0
    }

    pub fn y(&self) -> i32 {
        self.1
    }
}

/// Decoded arguments of a `computer` tool invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Screenshot,
    LeftClick {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinate: Option<Coordinate>,
    },
    DoubleClick,
    RightClick,
    MiddleClick,
    MouseMove {
        coordinate: Coordinate,
    },
    LeftClickDrag {
        coordinate: Coordinate,
    },
    Key {
        text: String,
    },
    Type {
        text: String,
    },
    CursorPosition,
    Finish,
}

impl Action {
    pub fn from_input(input: &Value) -> Result<Self, serde_json::Error> {
        Action::deserialize(input)
    }

    /// Wire name of the action, e.g. `left_click_drag`.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Screenshot => "screenshot",
            Action::LeftClick { .. } => "left_click",
            Action::DoubleClick => "double_click",
            Action::RightClick => "right_click",
            Action::MiddleClick => "middle_click",
            Action::MouseMove { .. } => "mouse_move",
            Action::LeftClickDrag { .. } => "left_click_drag",
            Action::Key { .. } => "key",
            Action::Type { .. } => "type",
            Action::CursorPosition => "cursor_position",
            Action::Finish => "finish",
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish)
    }
}

/// The fixed tool declaration sent with every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputerTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub display_width_px: u32,
    pub display_height_px: u32,
    pub display_number: u32,
}

impl ComputerTool {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            kind: COMPUTER_TOOL_TYPE.to_string(),
            name: COMPUTER_TOOL_NAME.to_string(),
            display_width_px: width,
            display_height_px: height,
            display_number: 1,
        }
    }
}
