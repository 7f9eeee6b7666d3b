/// UI surface the controller drives when a page guard fails or on logout.
///
/// A browser host maps these onto `alert` and `location.href`; a terminal
/// host prints and switches screens.
pub trait Navigator: Send + Sync + 'static {
    /// Show a user-facing message before navigation.
    fn notify(&self, message: &str);

    /// Navigate to `target`.
    fn redirect(&self, target: &str);
}

/// Default navigator: records both actions through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNavigator;

impl Navigator for LoggingNavigator {
    fn notify(&self, message: &str) {
        tracing::info!(notice = message, "Session notice");
    }

    fn redirect(&self, target: &str) {
        tracing::info!(to = target, "Session redirect");
    }
}
