//! Entry points behind the `meshdrop` binary.

pub mod args;
pub mod loopback;

use crate::core::negotiation::sdp;
use anyhow::{Context, Result};
use args::{Args, Command};

pub async fn run(args: Args) -> Result<()> {
    let settings = args.settings()?;

    match args.command {
        Command::Loopback { file, output, reject } => {
            match loopback::run(&settings, &file, output, reject).await? {
                loopback::Outcome::Delivered { bytes, output } => match output {
                    Some(path) => println!("delivered {bytes} bytes to {}", path.display()),
                    None => println!("delivered {bytes} bytes"),
                },
                loopback::Outcome::Rejected => println!("rejected by receiver"),
            }
        }
        Command::MungeSdp { file, .. } => {
            let original = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            print!("{}", sdp::transform(&original, &settings.negotiator));
        }
    }
    Ok(())
}
