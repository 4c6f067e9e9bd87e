use accelerated_bridge_cni::commands::{run_cni, CniError};
use accelerated_bridge_cni::logging;
use tracing::error;

fn main() {
    logging::init();

    // the process is single threaded, so namespace switches stay on this thread
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);
        CniError::from_anyhow(&err).print();
        std::process::exit(1);
    }
}
