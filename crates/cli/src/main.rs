use std::process::ExitCode;

fn main() -> ExitCode {
    warden_cli::run()
}
