use async_trait::async_trait;
use tracing::debug;

use crate::action::{Action, Coordinate};
use crate::error::DeviceError;
use crate::message::{Content, MediaType};

/// An encoded screen capture, already sized the way the model should see it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub media_type: MediaType,
}

/// The controllable surface. Implementations live outside this crate and
/// only own per-call state.
#[async_trait]
pub trait Device: Send + Sync {
    async fn capture_screenshot(&self) -> Result<Screenshot, DeviceError>;
    async fn tap(&self, x: i32, y: i32) -> Result<(), DeviceError>;
    async fn key(&self, text: &str) -> Result<(), DeviceError>;
    async fn type_text(&self, text: &str) -> Result<(), DeviceError>;
    async fn drag(&self, to: Coordinate) -> Result<(), DeviceError>;
    async fn move_to(&self, to: Coordinate) -> Result<(), DeviceError>;

    async fn cursor_position(&self) -> Result<Coordinate, DeviceError> {
        Err(DeviceError::Unsupported("cursor_position".into()))
    }

    async fn double_tap(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("double_click".into()))
    }

    async fn secondary_tap(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("right_click".into()))
    }

    async fn middle_tap(&self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("middle_click".into()))
    }
}

/// Runs one action and returns the content of its tool result.
///
/// `Finish` is handled by the conversation loop and never reaches a device.
pub async fn execute<D: Device + ?Sized>(device: &D, action: &Action) -> Result<Vec<Content>, DeviceError> {
    debug!(action = action.name(), "executing device action");
    match action {
        Action::Screenshot => {
            let shot = device.capture_screenshot().await?;
            Ok(screenshot_content(&shot))
        }
        Action::LeftClick { coordinate } => {
            let at = match coordinate {
                Some(c) => *c,
                None => device.cursor_position().await?,
            };
            device.tap(at.x(), at.y()).await?;
            Ok(done())
        }
        Action::DoubleClick => {
            device.double_tap().await?;
            Ok(done())
        }
        Action::RightClick => {
            device.secondary_tap().await?;
            Ok(done())
        }
        Action::MiddleClick => {
            device.middle_tap().await?;
            Ok(done())
        }
        Action::MouseMove { coordinate } => {
            device.move_to(*coordinate).await?;
            Ok(done())
        }
        Action::LeftClickDrag { coordinate } => {
            device.drag(*coordinate).await?;
            Ok(done())
        }
        Action::Key { text } => {
            device.key(text).await?;
            Ok(done())
        }
        Action::Type { text } => {
            device.type_text(text).await?;
            Ok(done())
        }
        Action::CursorPosition => {
            let at = device.cursor_position().await?;
            Ok(vec![Content::text(format!("X={},Y={}", at.x(), at.y()))])
        }
        Action::Finish => Err(DeviceError::Unsupported("finish".into())),
    }
}

pub(crate) fn screenshot_content(shot: &Screenshot) -> Vec<Content> {
    vec![
        Content::image(&shot.bytes, shot.media_type),
        Content::text(format!("Screenshot is {}x{} pixels.", shot.width, shot.height)),
    ]
}

fn done() -> Vec<Content> {
    vec![Content::text("ok")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn log(&self, call: String) {
            self.calls.lock().expect("lock").push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Device for Recorder {
        async fn capture_screenshot(&self) -> Result<Screenshot, DeviceError> {
            self.log("screenshot".into());
            Ok(Screenshot {
                bytes: vec![1, 2, 3],
                width: 640,
                height: 400,
                media_type: MediaType::Jpeg,
            })
        }

        async fn tap(&self, x: i32, y: i32) -> Result<(), DeviceError> {
            self.log(format!("tap {x},{y}"));
            Ok(())
        }

        async fn key(&self, text: &str) -> Result<(), DeviceError> {
            self.log(format!("key {text}"));
            Ok(())
        }

        async fn type_text(&self, text: &str) -> Result<(), DeviceError> {
            self.log(format!("type {text}"));
            Ok(())
        }

        async fn drag(&self, to: Coordinate) -> Result<(), DeviceError> {
            self.log(format!("drag {},{}", to.x(), to.y()));
            Ok(())
        }

        async fn move_to(&self, to: Coordinate) -> Result<(), DeviceError> {
            self.log(format!("move {},{}", to.x(), to.y()));
            Ok(())
        }

        async fn cursor_position(&self) -> Result<Coordinate, DeviceError> {
            Ok(Coordinate(7, 9))
        }
    }

    #[tokio::test]
    async fn actions_map_onto_device_calls() {
        let dev = Recorder::default();
        for action in [
            Action::LeftClick {
                coordinate: Some(Coordinate(1, 2)),
            },
            Action::LeftClick { coordinate: None },
            Action::MouseMove {
                coordinate: Coordinate(3, 4),
            },
            Action::LeftClickDrag {
                coordinate: Coordinate(5, 6),
            },
            Action::Key {
                text: "ctrl+a".into(),
            },
            Action::Type { text: "hi".into() },
        ] {
            assert_eq!(execute(&dev, &action).await.expect("ok"), vec![Content::text("ok")]);
        }
        assert_eq!(
            dev.calls(),
            vec!["tap 1,2", "tap 7,9", "move 3,4", "drag 5,6", "key ctrl+a", "type hi"]
        );
    }

    #[tokio::test]
    async fn screenshot_becomes_image_and_size_note() {
        let dev = Recorder::default();
        let content = execute(&dev, &Action::Screenshot).await.expect("shot");
        assert_eq!(content.len(), 2);
        assert!(matches!(&content[0], Content::Image { source } if source.media_type == MediaType::Jpeg));
        assert_eq!(content[1], Content::text("Screenshot is 640x400 pixels."));
    }

    #[tokio::test]
    async fn cursor_position_is_reported_as_text() {
        let dev = Recorder::default();
        let content = execute(&dev, &Action::CursorPosition).await.expect("pos");
        assert_eq!(content, vec![Content::text("X=7,Y=9")]);
    }

    #[tokio::test]
    async fn optional_gestures_default_to_unsupported() {
        let dev = Recorder::default();
        for action in [Action::DoubleClick, Action::RightClick, Action::MiddleClick] {
            let err = execute(&dev, &action).await.expect_err("unsupported");
            assert!(matches!(err, DeviceError::Unsupported(_)));
        }
        assert!(dev.calls().is_empty());
    }
}
