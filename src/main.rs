use std::process::ExitCode;

fn main() -> ExitCode {
    slcand_lib::run()
}
