// REPL byte framing and the script-upload state machine. Pure machine:
// bytes in, events out; the control loop owns command execution and
// response writing.
//
//   ^^X       command, recognized in any state, even mid-line
//   ```       toggles multi-line capture (normal mode only)
//   \n        terminates a single-line chunk
//
// Upload states: Normal → (^^s) → Reception → (^^e/^^w) → Normal.
// Overflow in Reception drops to Discard; ending a discarded upload
// reports failure and returns to Normal.

pub mod store;

/// Line assembly limit; beyond it the chunk is abandoned.
pub const MAX_LINE_BYTES: usize = 4096;

/// Upload accumulation limit.
pub const MAX_UPLOAD_BYTES: usize = store::MAX_SCRIPT_BYTES;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Version,
    Identity,
    PrintScript,
    ResetHint,
    Kill,
    Bootloader,
    StartUpload,
    EndUpload,
    FlashUpload,
    FlashClear,
    LoadDefault,
}

impl Command {
    fn from_letter(b: u8) -> Option<Command> {
        match b {
            b'v' => Some(Command::Version),
            b'i' => Some(Command::Identity),
            b'p' => Some(Command::PrintScript),
            b'r' => Some(Command::ResetHint),
            b'k' => Some(Command::Kill),
            b'b' => Some(Command::Bootloader),
            b's' => Some(Command::StartUpload),
            b'e' => Some(Command::EndUpload),
            b'w' => Some(Command::FlashUpload),
            b'c' => Some(Command::FlashClear),
            b'f' => Some(Command::LoadDefault),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplEvent {
    /// A recognized `^^` command (upload transitions already applied).
    Command(Command),
    /// A chunk ready for evaluation.
    Chunk(String),
    /// Upload terminated with its accumulated source.
    Upload { source: String, to_flash: bool },
    /// Upload terminated after an overflow.
    UploadFailed { to_flash: bool },
    /// Line assembly overflowed.
    ChunkTooLong,
}

#[derive(Debug, PartialEq, Eq)]
enum Upload {
    Normal,
    Reception(Vec<u8>),
    Discard,
}

pub struct Repl {
    line: Vec<u8>,
    caret_run: u8,
    backtick_run: u8,
    multiline: Option<Vec<u8>>,
    upload: Upload,
}

impl Repl {
    pub fn new() -> Self {
        Self {
            line: Vec::new(),
            caret_run: 0,
            backtick_run: 0,
            multiline: None,
            upload: Upload::Normal,
        }
    }

    pub fn uploading(&self) -> bool {
        !matches!(self.upload, Upload::Normal)
    }

    /// Feed raw link bytes; framed events are appended to `out`.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<ReplEvent>) {
        for &b in bytes {
            self.feed_byte(b, out);
        }
    }

    fn feed_byte(&mut self, b: u8, out: &mut Vec<ReplEvent>) {
        // Command sentinel wins over every other state.
        if self.caret_run == 2 {
            self.caret_run = 0;
            match Command::from_letter(b) {
                Some(cmd) => {
                    self.run_command(cmd, out);
                    return;
                }
                None => {
                    // Not a command: the carets were literal text.
                    self.push_text(b'^', out);
                    self.push_text(b'^', out);
                    // fall through to normal handling of b
                }
            }
        }
        if b == b'^' {
            self.caret_run += 1;
            return;
        }
        if self.caret_run == 1 {
            self.caret_run = 0;
            self.push_text(b'^', out);
        }

        // Triple backticks toggle multi-line capture in normal mode.
        if matches!(self.upload, Upload::Normal) {
            if b == b'`' {
                self.backtick_run += 1;
                if self.backtick_run == 3 {
                    self.backtick_run = 0;
                    self.toggle_multiline(out);
                }
                return;
            }
            if self.backtick_run > 0 {
                let run = std::mem::take(&mut self.backtick_run);
                for _ in 0..run {
                    self.push_text(b'`', out);
                }
            }
        }

        self.push_text(b, out);
    }

    fn toggle_multiline(&mut self, out: &mut Vec<ReplEvent>) {
        match self.multiline.take() {
            None => self.multiline = Some(Vec::new()),
            Some(buf) => {
                // Closing fence: evaluate the accumulated block.
                if !buf.is_empty() {
                    out.push(ReplEvent::Chunk(String::from_utf8_lossy(&buf).into_owned()));
                }
            }
        }
    }

    fn push_text(&mut self, b: u8, out: &mut Vec<ReplEvent>) {
        if let Some(buf) = self.multiline.as_mut() {
            if buf.len() < MAX_LINE_BYTES {
                buf.push(b);
            } else {
                self.multiline = None;
                self.overflow(out);
            }
            return;
        }

        if b == b'\n' || b == b'\r' {
            self.end_line(out);
            return;
        }

        if self.line.len() >= MAX_LINE_BYTES {
            self.line.clear();
            self.overflow(out);
            return;
        }
        self.line.push(b);
    }

    fn end_line(&mut self, out: &mut Vec<ReplEvent>) {
        if self.line.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line);
        let overflowed = match &mut self.upload {
            Upload::Normal => {
                out.push(ReplEvent::Chunk(String::from_utf8_lossy(&line).into_owned()));
                false
            }
            Upload::Reception(buf) => {
                if buf.len() + line.len() + 1 > MAX_UPLOAD_BYTES {
                    true
                } else {
                    buf.extend_from_slice(&line);
                    buf.push(b'\n');
                    false
                }
            }
            Upload::Discard => false,
        };
        if overflowed {
            self.upload = Upload::Discard;
            out.push(ReplEvent::ChunkTooLong);
        }
    }

    fn overflow(&mut self, out: &mut Vec<ReplEvent>) {
        out.push(ReplEvent::ChunkTooLong);
        if self.uploading() {
            self.upload = Upload::Discard;
        }
    }

    fn run_command(&mut self, cmd: Command, out: &mut Vec<ReplEvent>) {
        match cmd {
            Command::StartUpload => {
                self.line.clear();
                self.multiline = None;
                self.upload = Upload::Reception(Vec::new());
                out.push(ReplEvent::Command(cmd));
            }
            Command::EndUpload | Command::FlashUpload => {
                // Flush a trailing unterminated line into the buffer.
                self.end_line(out);
                let to_flash = cmd == Command::FlashUpload;
                match std::mem::replace(&mut self.upload, Upload::Normal) {
                    Upload::Reception(buf) => out.push(ReplEvent::Upload {
                        source: String::from_utf8_lossy(&buf).into_owned(),
                        to_flash,
                    }),
                    Upload::Discard => out.push(ReplEvent::UploadFailed { to_flash }),
                    Upload::Normal => out.push(ReplEvent::Command(cmd)),
                }
            }
            _ => out.push(ReplEvent::Command(cmd)),
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(repl: &mut Repl, s: &str) -> Vec<ReplEvent> {
        let mut out = Vec::new();
        repl.feed(s.as_bytes(), &mut out);
        out
    }

    #[test]
    fn command_fires_without_newline() {
        let mut repl = Repl::new();
        let out = feed_str(&mut repl, "^^v");
        assert_eq!(out, vec![ReplEvent::Command(Command::Version)]);
    }

    #[test]
    fn command_fires_mid_line() {
        let mut repl = Repl::new();
        let out = feed_str(&mut repl, "x = 1^^ky = 2\n");
        assert_eq!(out[0], ReplEvent::Command(Command::Kill));
        assert_eq!(out[1], ReplEvent::Chunk("x = 1y = 2".into()));
    }

    #[test]
    fn single_line_chunk_on_newline() {
        let mut repl = Repl::new();
        let out = feed_str(&mut repl, "output[1].volts = 3\n");
        assert_eq!(out, vec![ReplEvent::Chunk("output[1].volts = 3".into())]);
    }

    #[test]
    fn literal_carets_survive() {
        let mut repl = Repl::new();
        let out = feed_str(&mut repl, "a = 2^3\n");
        assert_eq!(out, vec![ReplEvent::Chunk("a = 2^3".into())]);
        let out = feed_str(&mut repl, "b = 2^^9\n");
        assert_eq!(out, vec![ReplEvent::Chunk("b = 2^^9".into())]);
    }

    #[test]
    fn multiline_block_is_one_chunk() {
        let mut repl = Repl::new();
        let out = feed_str(&mut repl, "```\nfunction init()\nend\n```");
        assert_eq!(out.len(), 1);
        match &out[0] {
            ReplEvent::Chunk(s) => {
                assert!(s.contains("function init()"));
                assert!(s.contains("end"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn upload_accumulates_and_ends_in_ram() {
        let mut repl = Repl::new();
        let mut out = feed_str(&mut repl, "^^s");
        assert_eq!(out.pop(), Some(ReplEvent::Command(Command::StartUpload)));
        assert!(repl.uploading());
        feed_str(&mut repl, "output[1].volts = 3\n");
        feed_str(&mut repl, "print('hi')\n");
        let out = feed_str(&mut repl, "^^e");
        assert_eq!(
            out,
            vec![ReplEvent::Upload {
                source: "output[1].volts = 3\nprint('hi')\n".into(),
                to_flash: false,
            }]
        );
        assert!(!repl.uploading());
    }

    #[test]
    fn commands_still_execute_during_upload() {
        let mut repl = Repl::new();
        feed_str(&mut repl, "^^s");
        feed_str(&mut repl, "line one\n");
        let out = feed_str(&mut repl, "^^v");
        assert_eq!(out, vec![ReplEvent::Command(Command::Version)]);
        let out = feed_str(&mut repl, "^^e");
        assert!(matches!(&out[0], ReplEvent::Upload { source, .. } if source == "line one\n"));
    }

    #[test]
    fn upload_overflow_discards_and_reports_failure() {
        let mut repl = Repl::new();
        feed_str(&mut repl, "^^s");
        let long_line = "x".repeat(1000) + "\n";
        let mut overflowed = false;
        for _ in 0..20 {
            if feed_str(&mut repl, &long_line).contains(&ReplEvent::ChunkTooLong) {
                overflowed = true;
            }
        }
        assert!(overflowed, "17 KiB of upload must overflow");
        // Further data is discarded quietly.
        assert!(feed_str(&mut repl, "more\n").is_empty());
        let out = feed_str(&mut repl, "^^w");
        assert_eq!(out, vec![ReplEvent::UploadFailed { to_flash: true }]);
        assert!(!repl.uploading());
    }

    #[test]
    fn line_overflow_resets_parser() {
        let mut repl = Repl::new();
        let huge = "y".repeat(MAX_LINE_BYTES + 10);
        let out = feed_str(&mut repl, &huge);
        assert!(out.contains(&ReplEvent::ChunkTooLong));
        // Parser recovered: next line frames normally.
        let out = feed_str(&mut repl, "\nz = 1\n");
        assert!(out.iter().any(|e| matches!(e, ReplEvent::Chunk(s) if s.contains("z = 1"))));
    }

    #[test]
    fn flash_upload_carries_flag() {
        let mut repl = Repl::new();
        feed_str(&mut repl, "^^s");
        feed_str(&mut repl, "-- seq.lua\n");
        let out = feed_str(&mut repl, "^^w");
        assert!(matches!(
            &out[0],
            ReplEvent::Upload { source, to_flash: true } if source.starts_with("-- seq.lua")
        ));
    }
}
