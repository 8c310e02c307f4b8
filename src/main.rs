use std::process::ExitCode;

fn main() -> ExitCode {
    match focuslog_lib::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("focuslog: {err:#}");
            ExitCode::FAILURE
        }
    }
}
