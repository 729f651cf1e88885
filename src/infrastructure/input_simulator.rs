use tracing::trace;

/// Moves the system pointer by relative offsets
pub trait CursorMover: Send {
    fn move_by(&mut self, dx: i32, dy: i32) -> anyhow::Result<()>;
}

/// Native cursor back-end for the current platform
pub fn platform_cursor() -> Box<dyn CursorMover> {
    #[cfg(windows)]
    {
        Box::new(InputSimulator::new())
    }
    #[cfg(not(windows))]
    {
        Box::new(TracingCursor)
    }
}

/// Logs deltas instead of moving anything; used where no injector exists
#[derive(Debug, Default)]
pub struct TracingCursor;

impl CursorMover for TracingCursor {
    fn move_by(&mut self, dx: i32, dy: i32) -> anyhow::Result<()> {
        trace!("Pointer delta ({}, {})", dx, dy);
        Ok(())
    }
}

#[cfg(windows)]
pub use self::win32::InputSimulator;

#[cfg(windows)]
mod win32 {
    use super::CursorMover;
    use tracing::trace;
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        SendInput, INPUT, INPUT_0, INPUT_MOUSE, MOUSEEVENTF_MOVE, MOUSEINPUT,
    };

    pub struct InputSimulator;

    impl InputSimulator {
        pub fn new() -> Self {
            Self
        }

        /// Move mouse by relative offset
        pub fn move_mouse(&self, dx: i32, dy: i32) -> anyhow::Result<()> {
            trace!("Moving mouse by ({}, {})", dx, dy);
            let input = INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx,
                        dy,
                        mouseData: 0,
                        dwFlags: MOUSEEVENTF_MOVE,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            };

            let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
            if sent == 0 {
                anyhow::bail!("SendInput rejected pointer move");
            }
            Ok(())
        }
    }

    impl CursorMover for InputSimulator {
        fn move_by(&mut self, dx: i32, dy: i32) -> anyhow::Result<()> {
            self.move_mouse(dx, dy)
        }
    }
}
