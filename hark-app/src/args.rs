//! Command-line flags.

use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: hark [--listen | --wav <file.wav>] [options]

Type a line and press enter to start a turn; newer input cancels older work.

Modes:
  (default)             text input only
  --listen              also listen on the microphone
  --wav <file>          replay a WAV file through the listener, print the reply, exit

Options:
  --device-playback     play replies on the default output device
  --settings <file>     settings file (default: user data directory)
  --save-settings       write the effective settings back to the settings file
  --list-devices        print audio devices and exit
  -h, --help            show this help

Commands while running:
  :status   print the status projection as JSON
  :wait     wait until the newest input is handled, print the reply
  :diag     print listener and turn counters
  :quit     stop and exit (also `quit`, `exit`, end of input)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Text,
    Listen,
    Wav(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub mode: Mode,
    pub device_playback: bool,
    pub settings: Option<PathBuf>,
    pub save_settings: bool,
    pub list_devices: bool,
    pub help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: Mode::Text,
            device_playback: false,
            settings: None,
            save_settings: false,
            list_devices: false,
            help: false,
        }
    }
}

pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut out = Args::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--listen" => set_mode(&mut out, Mode::Listen)?,
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                set_mode(&mut out, Mode::Wav(PathBuf::from(v)))?;
            }
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --settings".into());
                };
                out.settings = Some(PathBuf::from(v));
            }
            "--device-playback" => out.device_playback = true,
            "--save-settings" => out.save_settings = true,
            "--list-devices" => out.list_devices = true,
            "--help" | "-h" => out.help = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(out)
}

fn set_mode(args: &mut Args, mode: Mode) -> Result<(), String> {
    if args.mode != Mode::Text {
        return Err("--listen and --wav are mutually exclusive".into());
    }
    args.mode = mode;
    Ok(())
}
