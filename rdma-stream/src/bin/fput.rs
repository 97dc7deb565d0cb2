//! Transmitter binary: `fput [-r] [-g] <peer-address>`.

use std::process::ExitCode;

fn main() -> ExitCode {
    rdma_stream::main(&std::env::args().collect::<Vec<_>>())
}
