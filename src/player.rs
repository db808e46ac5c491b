use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Local monitor output wrapping rodio. Lets the operator hear what goes
/// out on the stream. Not `Send`: lives on the audio-runtime thread.
pub struct MonitorPlayer {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sink: Sink,
}

impl MonitorPlayer {
    /// Open the default output device.
    pub fn new() -> Result<Self, String> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| format!("Failed to open audio output: {}", e))?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| format!("Failed to create audio sink: {}", e))?;
        Ok(MonitorPlayer {
            _stream: stream,
            _handle: handle,
            sink,
        })
    }

    /// Replace whatever plays with `path`.
    pub fn play_file(&self, path: &Path) -> Result<(), String> {
        let file = File::open(path)
            .map_err(|e| format!("Cannot open '{}': {}", path.display(), e))?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| format!("Cannot decode '{}': {}", path.display(), e))?;
        self.sink.stop();
        self.sink.append(source);
        self.sink.play();
        Ok(())
    }

    pub fn stop(&self) {
        self.sink.stop();
    }

    pub fn pause(&self) {
        self.sink.pause();
    }

    pub fn resume(&self) {
        self.sink.play();
    }

    pub fn is_paused(&self) -> bool {
        self.sink.is_paused()
    }

    /// True when the sink has finished all queued audio.
    pub fn is_empty(&self) -> bool {
        self.sink.empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_missing_file_fails_cleanly() {
        // No audio device in CI is fine: either constructor or play errors.
        if let Ok(player) = MonitorPlayer::new() {
            assert!(player.play_file(Path::new("__nonexistent_file__.mp3")).is_err());
            assert!(player.is_empty());
        }
    }
}
