use std::io::Write;

use tracing::info;

use pantry_client::notify::{AlertSink, Permission};

/// Alerts for a terminal: the bell is the sound cue, notifications are log
/// lines. A terminal cannot tell whether it has focus, so the caller says.
pub struct TerminalAlerts {
    focused: bool,
}

impl TerminalAlerts {
    pub fn new(focused: bool) -> Self {
        Self { focused }
    }
}

impl AlertSink for TerminalAlerts {
    fn is_focused(&self) -> bool {
        self.focused
    }

    fn request_permission(&self) -> Permission {
        Permission::Granted
    }

    fn show_notification(&self, title: &str, body: &str) {
        info!("{}: {}", title, body);
    }

    fn play_sound(&self) {
        let mut out = std::io::stdout();
        let _ = out.write_all(b"\x07");
        let _ = out.flush();
    }
}
