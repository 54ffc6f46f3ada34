use anyhow::{Context, Result};
use avdl::cli::{prompt_command, prompt_line, Args};
use avdl::coordinator::DownloadCoordinator;
use avdl::curl::parse_curl_command;
use avdl::downloader::{ResumableDownloader, TransferRequest};
use avdl::muxer::Muxer;
use avdl::utils::{clear_cache, create_cache, resolve_output_path, staging_path};
use clap::Parser;
use std::io::{self, BufRead};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("avdl=warn")),
        )
        .init();

    let stdin = io::stdin();
    let mut input = stdin.lock();

    let name = match args.name.clone() {
        Some(name) => name,
        None => prompt_line(
            &mut input,
            "Output file name (e.g. my_video) [leave blank for a random name]:",
        )?,
    };
    let output = resolve_output_path(&args.output_dir, Some(name.as_str()));
    println!("Output file: {}", output.display());

    let video = read_command(&mut input, "Paste the cURL command for the VIDEO stream (end with a blank line):")
        .context("Failed to parse video cURL command")?;
    let audio = read_command(&mut input, "Paste the cURL command for the AUDIO stream (end with a blank line):")
        .context("Failed to parse audio cURL command")?;
    drop(input);

    // Start the runtime only once all interactive input is in.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        create_cache(&args.cache_dir).await?;

        let audio = TransferRequest::new(&audio.url, audio.headers, staging_path(&args.cache_dir))?;
        let video = TransferRequest::new(&video.url, video.headers, staging_path(&args.cache_dir))?;

        let downloader = ResumableDownloader::new()
            .with_retry_policy(args.retry_policy())
            .with_stall_timeout(args.stall_timeout())
            .with_first_response_timeout(args.first_response_timeout());
        let coordinator = DownloadCoordinator::new(downloader);

        println!("Downloading audio and video...");
        let pair = match coordinator.run_both(audio, video).await {
            Ok(pair) => pair,
            Err(err) => {
                if let Some(done) = &err.other {
                    eprintln!(
                        "\n{} stream had finished before the failure: {}",
                        err.role.other(),
                        done.path.display()
                    );
                }
                return Err(err.into());
            }
        };
        info!(audio = ?pair.audio.path, video = ?pair.video.path, "downloads finished");

        println!("\nDownloads finished, combining audio and video...");
        let output = Muxer::new(&args.ffmpeg)
            .combine(&pair.video.path, &pair.audio.path, &output)
            .await?;

        if !args.keep_cache {
            clear_cache(&args.cache_dir).await?;
        }
        println!("Saved {}", output.display());
        Ok::<(), anyhow::Error>(())
    })
}

fn read_command(input: &mut impl BufRead, prompt: &str) -> Result<avdl::curl::CurlInput> {
    let command = prompt_command(input, prompt)?;
    Ok(parse_curl_command(&command)?)
}
