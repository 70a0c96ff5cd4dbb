use std::process::ExitCode;

use afterglow::AppConfig;

const USAGE: &str = "usage: afterglow [--png <path> [WIDTHxHEIGHT]]";

fn parse_size(arg: &str) -> Option<(u32, u32)> {
    let (w, h) = arg.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = AppConfig::new();

    let result = match args.as_slice() {
        [] => afterglow::run_with_config(config),
        [flag, path, rest @ ..] if flag == "--png" && rest.len() <= 1 => {
            let size = match rest.first() {
                Some(arg) => parse_size(arg),
                None => Some((640, 360)),
            };
            let Some((width, height)) = size.filter(|&(w, h)| w > 0 && h > 0) else {
                eprintln!("{USAGE}");
                return ExitCode::FAILURE;
            };
            afterglow::render_png(path, width, height, &config, 1.0)
        }
        _ => {
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
