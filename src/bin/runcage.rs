use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    runcage::cli::run()
}
