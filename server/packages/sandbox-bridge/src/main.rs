fn main() {
    if let Err(err) = sandbox_bridge::cli::run_sandbox_bridge() {
        tracing::error!(error = %err, "sandbox-bridge failed");
        std::process::exit(1);
    }
}
