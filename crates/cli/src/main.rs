use std::process::ExitCode;

fn main() -> ExitCode {
    finops_cli::run()
}
