use crate::logging::init_logging;

/// Call first thing in every test so panics and tracing output end up in the
/// test's captured output.
pub fn setup_test() {
    init_logging();
}
