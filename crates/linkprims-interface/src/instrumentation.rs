//! Hooks a script runner calls around each executed line.

use std::error::Error;

/// Per-line callbacks for a script runner.
pub trait ScriptInstrumentation {
    fn pre_line_instrumentation(&mut self, filename: &str, line_no: usize);

    fn post_line_instrumentation(&mut self, filename: &str, line_no: usize);

    /// Called when a line fails. Return `true` to run the line again.
    fn exception_instrumentation(&mut self, error: &dyn Error, filename: &str, line_no: usize) -> bool;
}

/// Run one script line under `instrumentation`, retrying while the
/// exception hook asks for it. The final error is returned when it declines.
pub fn instrument_line<T, E, F>(
    instrumentation: &mut dyn ScriptInstrumentation,
    filename: &str,
    line_no: usize,
    mut body: F,
) -> Result<T, E>
where
    E: Error,
    F: FnMut() -> Result<T, E>,
{
    loop {
        instrumentation.pre_line_instrumentation(filename, line_no);
        let result = body();
        instrumentation.post_line_instrumentation(filename, line_no);
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !instrumentation.exception_instrumentation(&err, filename, line_no) {
                    return Err(err);
                }
            }
        }
    }
}
