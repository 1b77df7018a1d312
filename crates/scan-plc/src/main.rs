mod infra;
mod runtime;

fn main() {
    if let Err(e) = runtime::run_from_args() {
        eprintln!("scan-plc: {e}");
        std::process::exit(1);
    }
}
