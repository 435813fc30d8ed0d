use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 要下载的地址
    pub url: String,

    /// 保存路径，缺省使用下载目录 + URL 中的文件名
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// 并发分片数
    #[arg(short, long, default_value_t = 3)]
    pub threads: u32,

    /// 整体限速（字节/秒），缺省不限速
    #[arg(long)]
    pub max_speed: Option<u64>,

    /// 期望的整文件 MD5，给出后下载完成时校验
    #[arg(long)]
    pub md5: Option<String>,

    /// 停止时丢弃未完成的数据（缺省保留以便续传）
    #[arg(long)]
    pub discard_partial: bool,

    /// 日志文件路径
    #[arg(long)]
    pub log_file: Option<String>,

    /// 输出调试日志
    #[arg(short, long)]
    pub verbose: bool,
}
