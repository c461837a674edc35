use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use drawscope_config::{AppConfig, ConfigError};
use drawscope_core::cancel::CancelToken;
use drawscope_engine::render::RasterFormat;
use drawscope_frontend::{ConversionRequest, DrawingService, RectPayload, RenderParams, ServiceError};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// 图纸分析工具：计算范围与重点区域、按需渲染、转换二进制图纸。结果以 JSON 输出到标准输出。
#[derive(Debug, Parser)]
#[command(name = "drawscope", version)]
struct Cli {
    /// 配置文件路径，缺省时依次尝试 DRAWSCOPE_CONFIG 与 ./config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// 覆盖配置中的日志等级
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 图纸范围与按优先级排序的区域
    Bounds {
        path: PathBuf,
        #[arg(long, value_delimiter = ',')]
        layers: Option<Vec<String>>,
        /// 本次识别使用的网格边长（图纸单位），覆盖配置
        #[arg(long)]
        grid_size: Option<f64>,
    },
    /// 渲染图纸坐标中的矩形 `x,y,width,height`
    Render {
        path: PathBuf,
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: RectPayload,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// 渲染整张图纸
    Overview {
        path: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// 识别区域并渲染前 N 个
    Regions {
        path: PathBuf,
        #[arg(long, default_value_t = 3)]
        top: usize,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// 将 DWG 文件或目录转换为 DXF
    Convert {
        source: PathBuf,
        #[arg(long)]
        dest: Option<PathBuf>,
        /// 输出版本，例如 ACAD2018
        #[arg(long = "output-version")]
        output_version: Option<String>,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        audit: bool,
    },
}

#[derive(Debug, Args)]
struct OutputArgs {
    /// 画布尺寸 `WxH` 或单个边长
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,
    #[arg(long, value_delimiter = ',')]
    layers: Option<Vec<String>>,
    /// png（无损）或 jpeg（有损）
    #[arg(long, default_value = "png")]
    format: RasterFormat,
}

impl OutputArgs {
    fn into_params(self) -> RenderParams {
        RenderParams {
            output_size: self.size,
            layers: self.layers,
            format: self.format,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, discovery_error) = match load_configuration(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            return report_failure(&ServiceError::from(err));
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging.level);
    if let Some(err) = discovery_error {
        warn!(error = %err, "加载默认配置失败，使用内建默认值");
    }

    let service = match DrawingService::new(config) {
        Ok(service) => service,
        Err(err) => return report_failure(&err),
    };
    let cancel = CancelToken::new();

    match cli.command {
        Command::Bounds {
            path,
            layers,
            grid_size,
        } => emit(service.get_drawing_bounds(&path, layers.as_deref(), grid_size)),
        Command::Render { path, bbox, output } => {
            emit(service.render_region(&path, bbox, &output.into_params(), &cancel))
        }
        Command::Overview { path, output } => emit(service.render_overview(&path, &output.into_params(), &cancel)),
        Command::Regions { path, top, output } => {
            emit(service.render_regions(&path, top, &output.into_params(), &cancel))
        }
        Command::Convert {
            source,
            dest,
            output_version,
            recursive,
            audit,
        } => {
            let request = ConversionRequest {
                source,
                destination: dest,
                version: output_version,
                recursive,
                audit,
            };
            match service.convert(&request, &cancel) {
                Ok(payload) => {
                    let success = payload.success;
                    let code = emit(Ok(payload));
                    if success { code } else { ExitCode::FAILURE }
                }
                Err(err) => report_failure(&err),
            }
        }
    }
}

/// 显式路径加载失败是错误；自动发现失败时回退到默认配置，错误留待日志初始化后报告。
fn load_configuration(explicit: Option<&Path>) -> Result<(AppConfig, Option<ConfigError>), ConfigError> {
    match explicit {
        Some(path) => AppConfig::from_file(path).map(|cfg| (cfg, None)),
        None => match AppConfig::discover() {
            Ok(cfg) => Ok((cfg, None)),
            Err(err) => Ok((AppConfig::default(), Some(err))),
        },
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // 标准输出只留给 JSON 结果；重复初始化时忽略
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn emit<T: Serialize>(result: Result<T, ServiceError>) -> ExitCode {
    match result {
        Ok(payload) => match serde_json::to_string_pretty(&payload) {
            Ok(text) => {
                println!("{text}");
                info!("操作完成");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "序列化结果失败");
                ExitCode::FAILURE
            }
        },
        Err(err) => report_failure(&err),
    }
}

fn report_failure(err: &ServiceError) -> ExitCode {
    error!(kind = err.kind(), error = %err, "操作失败");
    let body = serde_json::json!({ "error": err.report() });
    match serde_json::to_string_pretty(&body) {
        Ok(text) => println!("{text}"),
        Err(_) => eprintln!("{err}"),
    }
    ExitCode::FAILURE
}

fn parse_bbox(value: &str) -> Result<RectPayload, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("bbox 必须是四个数字 x,y,width,height：{err}"))?;
    match parts.as_slice() {
        [x, y, width, height] => Ok(RectPayload {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
        }),
        _ => Err(format!("bbox 需要四个数字，实际为 {}", parts.len())),
    }
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let parse = |text: &str| {
        text.trim()
            .parse::<u32>()
            .map_err(|err| format!("无效的尺寸 {text}：{err}"))
    };
    match value.split_once(['x', 'X']) {
        Some((width, height)) => Ok((parse(width)?, parse(height)?)),
        None => {
            let side = parse(value)?;
            Ok((side, side))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_and_size_arguments_parse() {
        let bbox = parse_bbox("1000, 2000,5000,3000").expect("解析失败");
        assert!((bbox.width - 5000.0).abs() < 1e-9);
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());

        assert_eq!(parse_size("2048x1024"), Ok((2048, 1024)));
        assert_eq!(parse_size("512"), Ok((512, 512)));
        assert!(parse_size("12xq").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_origin_is_accepted() {
        let cli = Cli::try_parse_from(["drawscope", "render", "plan.dxf", "--bbox", "-10,-20,30,40"])
            .expect("解析失败");
        let Command::Render { bbox, output, .. } = cli.command else {
            panic!("应当解析为 render");
        };
        assert!((bbox.x + 10.0).abs() < 1e-9);
        assert_eq!(output.format, RasterFormat::Png);
        assert!(output.size.is_none());
    }

    #[test]
    fn bounds_accepts_grid_size_override() {
        let cli = Cli::try_parse_from(["drawscope", "bounds", "plan.dxf", "--grid-size", "250"]).expect("解析失败");
        let Command::Bounds { grid_size, layers, .. } = cli.command else {
            panic!("应当解析为 bounds");
        };
        assert_eq!(grid_size, Some(250.0));
        assert!(layers.is_none());
    }
}
