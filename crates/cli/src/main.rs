use std::process::ExitCode;

fn main() -> ExitCode {
    fleetrun_cli::run()
}
