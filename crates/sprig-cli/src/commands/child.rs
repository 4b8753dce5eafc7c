use super::exit_byte;
use sprig_runtime::RunRequest;

/// Sandbox phase. Runs as PID 1 of the fresh namespaces.
pub fn run(request: &RunRequest) -> Result<u8, String> {
    let code = sprig_core::run_child(request).map_err(|e| e.to_string())?;
    Ok(exit_byte(code))
}
