//! Receiver binary: `fget [-b <bind-address>] [-r]`.

use std::process::ExitCode;

fn main() -> ExitCode {
    rdma_stream::main(&std::env::args().collect::<Vec<_>>())
}
