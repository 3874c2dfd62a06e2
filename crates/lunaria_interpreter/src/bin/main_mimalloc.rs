// Interpreter variant backed by mimalloc, for allocation-heavy
// workloads.

use lunaria_interpreter::{parse_args, print_usage, run};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Ok(opts) => std::process::exit(run(opts)),
        Err(msg) => {
            eprintln!("lunaria: {}", msg);
            print_usage();
            std::process::exit(1);
        }
    }
}
