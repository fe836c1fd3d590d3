/// The terminal widget the adapter renders into.
pub trait TerminalSink: Send {
    /// Clears the display.
    fn reset(&mut self);

    fn on_data_received(&mut self, text: &str);

    /// Shows a status line in place of the live session (connecting banner,
    /// close reason, remediation hint).
    fn on_connection_closed(&mut self, message: &str);
}

impl<T: TerminalSink + ?Sized> TerminalSink for Box<T> {
    fn reset(&mut self) {
        (**self).reset()
    }

    fn on_data_received(&mut self, text: &str) {
        (**self).on_data_received(text)
    }

    fn on_connection_closed(&mut self, message: &str) {
        (**self).on_connection_closed(message)
    }
}
