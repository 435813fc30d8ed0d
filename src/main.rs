mod cli;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use log::{error, info};

use slice_downloader::download::logger;
use slice_downloader::{
    init, uninit, DownloadCallbacks, DownloadResult, FileDownloader, HashType, HashVerifyPolicy,
    UncompletedSliceSavePolicy,
};

use crate::cli::CliArgs;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if let Err(err) = logger::setup_logger(level, args.log_file.as_deref()) {
        eprintln!("Setup logger failed: {}", err);
    }

    let target_path = match args.output.clone() {
        Some(path) => path,
        None => default_target_path(&args.url),
    };

    init();

    let mut downloader = FileDownloader::new();
    downloader.set_thread_num(args.threads);
    downloader.set_max_speed(args.max_speed);
    if let Some(md5) = args.md5.clone() {
        downloader.set_hash_verify_policy(HashVerifyPolicy::AlwaysVerify, HashType::Md5, Some(md5));
    }
    if args.discard_partial {
        downloader.set_uncompleted_slice_save_policy(UncompletedSliceSavePolicy::AlwaysDiscard);
    }

    // speed 回调只负责记录，进度行统一打印
    let speed_value = Arc::new(AtomicU64::new(0));
    let speed_in_progress = speed_value.clone();
    let callbacks = DownloadCallbacks {
        progress: Some(Box::new(move |total, downloaded| {
            let speed = speed_in_progress.load(Ordering::Relaxed);
            match total {
                Some(total) if total > 0 => {
                    print!(
                        "\r{:>3}% - {} / {} - {}/s   ",
                        downloaded * 100 / total,
                        format_bytes(downloaded),
                        format_bytes(total),
                        format_bytes(speed)
                    );
                }
                _ => print!("\r{} - {}/s   ", format_bytes(downloaded), format_bytes(speed)),
            }
            let _ = std::io::stdout().flush();
        })),
        speed: Some(Box::new(move |speed| {
            speed_value.store(speed, Ordering::Relaxed);
        })),
        ..Default::default()
    };

    let handle = match downloader.start(&args.url, &target_path, callbacks) {
        Ok(handle) => handle,
        Err(err) => {
            error!("Start download failed: {}", err);
            uninit();
            return ExitCode::FAILURE;
        }
    };

    let result = handle.await.unwrap_or(DownloadResult::UnknownError);
    println!();
    uninit();

    if result == DownloadResult::Success {
        info!("Saved to {}", target_path.display());
        ExitCode::SUCCESS
    } else {
        error!("Download failed: {}", result.as_str());
        ExitCode::FAILURE
    }
}

fn default_target_path(url: &str) -> PathBuf {
    let file_name = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segments| segments.last().map(|s| s.to_string()))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download.bin".to_string());

    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(file_name)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut value = bytes as f64;
    let mut i = 0;
    while value >= 1024.0 && i < UNITS.len() - 1 {
        value /= 1024.0;
        i += 1;
    }

    format!("{:.2} {}", value, UNITS[i])
}
