use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Replay a scene description through the sync engine
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Scene description (JSON) to synchronize
    #[arg(value_name = "SCENE")]
    pub scene: PathBuf,

    /// Number of sync passes to run (auto-sync interval applies between passes)
    #[arg(short = 'n', long = "passes", value_name = "N", default_value_t = 1)]
    pub passes: u32,

    /// Property batch (JSON) to import after the first pass
    #[arg(short = 'i', long = "import", value_name = "FILE")]
    pub import: Option<PathBuf>,

    /// Write every exported property batch to this file (JSON)
    #[arg(short = 'e', long = "export", value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Worker threads override (0 = auto)
    #[arg(short = 'w', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Settings file (default: scenelink.json in the config directory)
    #[arg(short = 's', long = "settings", value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Enable debug logging to file (default: scenelink.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_command_line() {
        let args = Args::try_parse_from([
            "scenelink", "scene.json", "-n", "3", "--import", "in.json", "-e", "out.json", "-w", "2", "-vv", "--log",
        ])
        .unwrap();
        assert_eq!(args.scene, PathBuf::from("scene.json"));
        assert_eq!(args.passes, 3);
        assert_eq!(args.import, Some(PathBuf::from("in.json")));
        assert_eq!(args.export, Some(PathBuf::from("out.json")));
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.log_file, Some(None));
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["scenelink", "scene.json"]).unwrap();
        assert_eq!(args.passes, 1);
        assert!(args.log_file.is_none());
        assert!(args.settings.is_none());
    }

    #[test]
    fn test_scene_is_required() {
        assert!(Args::try_parse_from(["scenelink"]).is_err());
    }
}
