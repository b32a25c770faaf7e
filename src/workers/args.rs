//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML settings file
//! - Merging CLI with file settings (CLI takes precedence)

use crate::core::config::{ChunkEncoding, Settings};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Settings file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG: &str = "meshdrop.toml";

/// meshdrop - peer-to-peer session negotiation and chunked transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML settings file. Defaults to ./meshdrop.toml when it exists.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Chunk size in bytes.
    #[clap(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Seconds to wait for the peer's next reply.
    #[clap(long, global = true)]
    pub timeout: Option<u64>,

    /// Send chunks as base64 text frames.
    #[clap(long, global = true)]
    pub base64: bool,

    /// Enable Opus stereo when rewriting session descriptions.
    #[clap(long, global = true)]
    pub stereo: bool,

    /// Wait for ICE gathering instead of trickling candidates.
    #[clap(long, global = true)]
    pub no_trickle: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Transfer a file between two in-process peers over a memory channel.
    Loopback {
        /// File to send.
        file: PathBuf,

        /// Where the receiving side writes its copy.
        #[clap(long, short)]
        output: Option<PathBuf>,

        /// Have the receiver decline the request.
        #[clap(long)]
        reject: bool,
    },

    /// Apply the configured SDP rewrites to a session description file.
    MungeSdp {
        /// SDP file to rewrite.
        file: PathBuf,

        /// Audio bandwidth cap in kbps.
        #[clap(long)]
        audio_kbps: Option<u32>,

        /// Video bandwidth cap in kbps.
        #[clap(long)]
        video_kbps: Option<u32>,

        /// Data channel bandwidth cap in kbps.
        #[clap(long)]
        data_kbps: Option<u32>,
    },
}

impl Args {
    pub fn load() -> Self {
        Args::parse()
    }

    /// Settings from the file (if any) with CLI overrides applied.
    pub fn settings(&self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => Some(Settings::load(path)?),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG);
                if default_path.exists() {
                    Some(Settings::load(default_path)?)
                } else {
                    None
                }
            }
        };
        Ok(self.merge(file.unwrap_or_default()))
    }

    /// Merge CLI values into file settings (CLI takes precedence).
    fn merge(&self, mut settings: Settings) -> Settings {
        if let Some(chunk_size) = self.chunk_size {
            settings.transfer.chunk_size = chunk_size;
        }
        if let Some(timeout) = self.timeout {
            settings.transfer.timeout_secs = timeout;
        }
        if self.base64 {
            settings.transfer.encoding = ChunkEncoding::Base64;
        }
        if self.stereo {
            settings.negotiator.stereo = true;
        }
        if self.no_trickle {
            settings.negotiator.ice_trickle = false;
        }
        if let Command::MungeSdp {
            audio_kbps,
            video_kbps,
            data_kbps,
            ..
        } = &self.command
        {
            let bandwidth = &mut settings.negotiator.bandwidth;
            bandwidth.audio = audio_kbps.or(bandwidth.audio);
            bandwidth.video = video_kbps.or(bandwidth.video);
            bandwidth.data = data_kbps.or(bandwidth.data);
        }
        settings
    }
}
