//! Dedicated JavaScript worker binary, for deployments that set
//! `JS_WORKER_PROGRAM` instead of re-executing the server

use polyglot_engine::backend::js_worker::{run_if_requested, WORKER_ARG};

fn main() {
    let code = run_if_requested().unwrap_or_else(|| {
        eprintln!(
            "polyglot-js-worker is started by the execution engine (first argument {})",
            WORKER_ARG
        );
        2
    });
    std::process::exit(code);
}
