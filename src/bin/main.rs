// pulp-transcode: convert a cover image into an e-ink ready BMP.
//
// pulp-transcode <input> <output> [--size WxH] [--one-bit] [--quick] [--tag TAG] [--thumbnail]
//
// JPEG and PNG are decoded, scaled into the box and quantized; BMP input
// is copied as-is, or with --thumbnail rescaled to a 1-bit thumbnail.

use std::env;
use std::process::ExitCode;

use pulp_transcode::{DirStorage, ImageConvertConfig, convert_to_bmp, thumbnail_to_bmp};

const USAGE: &str = "Usage: pulp-transcode <input> <output> [--size WxH] [--one-bit] [--quick] [--tag TAG] [--thumbnail]";

fn parse_size(s: &str) -> Option<(u16, u16)> {
    let (w, h) = s.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    }

    let input = args.remove(0);
    let output = args.remove(0);

    let mut config = ImageConvertConfig::default();
    let mut tag = None;
    let mut thumbnail = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--size" => {
                i += 1;
                match args.get(i).and_then(|s| parse_size(s)) {
                    Some((w, h)) => {
                        config.max_width = w;
                        config.max_height = h;
                    }
                    None => {
                        eprintln!("--size expects WxH, e.g. 450x750");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "--one-bit" => config.one_bit = true,
            "--quick" => config.quick_mode = true,
            "--thumbnail" => thumbnail = true,
            "--tag" => {
                i += 1;
                tag = args.get(i).cloned();
            }
            other => {
                eprintln!("unknown option {other}\n{USAGE}");
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let tag = tag.unwrap_or_else(|| "IMG".to_string());
    config.log_tag = &tag;

    let storage = DirStorage::new("");
    let result = if thumbnail {
        thumbnail_to_bmp(&storage, &input, &output, &config)
    } else {
        convert_to_bmp(&storage, &input, &output, &config)
    };

    match result {
        Ok(()) => {
            println!("Wrote {output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Conversion failed: {err}");
            ExitCode::FAILURE
        }
    }
}
