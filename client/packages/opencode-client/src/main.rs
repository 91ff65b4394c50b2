fn main() {
    if let Err(err) = opencode_client::cli::run_opencode_client() {
        tracing::error!(error = %err, "opencode-client failed");
        std::process::exit(1);
    }
}
