use std::process::ExitCode;

fn main() -> ExitCode {
    reck::main()
}
