use asb_client_cli::{run_cli, CliError};
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!("CLI error: {}", e);
        eprintln!("error: {}", e);

        // Exit with appropriate code based on error type
        let exit_code = match e {
            CliError::Configuration(_) => 1,
            CliError::ServiceBus(_) => 2,
            CliError::InvalidArgument { .. } => 3,
            CliError::Logging { .. } => 4,
            CliError::Task { .. } => 5,
        };

        std::process::exit(exit_code);
    }
}
