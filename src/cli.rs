use clap::{ArgAction, Parser, Subcommand};

/// 隧道服务命令行
#[derive(Debug, Parser)]
#[command(name = "nat-tunnel", version, about)]
pub struct Cli {
    /// 日志详细程度（-v info, -vv debug, -vvv trace）
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// 运行服务器
    Server {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },

    /// 校验配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}
