//! Frame emitters: PNG and PPM writers plus an async wrapper.
//!
//! Snapshots are named `out.<epoch:04>.<batch:04>.<ext>` so a frame sequence
//! sorts into doubling order. The async wrapper moves encoding and disk IO
//! onto a worker thread; it receives owned pixel buffers, never a view of
//! the live grid, so the simulation keeps stepping while frames are written.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// An owned H x W RGB image (3 bytes per pixel, row-major).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

/// Persists one snapshot per call. Implementations report failures but do
/// not touch simulation state.
pub trait Emitter: Send {
    fn emit(&mut self, frame: &Frame, epoch: u32, batch: u32) -> io::Result<()>;

    /// Flush anything still in flight and return how many queued frames
    /// failed to write. Synchronous emitters report failures from `emit`
    /// directly, so their count here is always zero.
    fn finish(&mut self) -> io::Result<u64> {
        Ok(0)
    }
}

pub fn frame_filename(epoch: u32, batch: u32, ext: &str) -> String {
    format!("out.{:04}.{:04}.{}", epoch, batch, ext)
}

/// PNG writer using fast compression (good ratio, cheap to encode).
pub struct PngEmitter {
    dir: PathBuf,
}

impl PngEmitter {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir: dir.as_ref().to_path_buf() })
    }
}

impl Emitter for PngEmitter {
    fn emit(&mut self, frame: &Frame, epoch: u32, batch: u32) -> io::Result<()> {
        let path = self.dir.join(frame_filename(epoch, batch, "png"));
        let file = File::create(&path)?;
        let w = BufWriter::new(file);

        let mut encoder = png::Encoder::new(w, frame.width as u32, frame.height as u32);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);

        let mut writer = encoder
            .write_header()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        writer
            .write_image_data(&frame.pixels)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }
}

/// Uncompressed P6 PPM writer.
pub struct PpmEmitter {
    dir: PathBuf,
}

impl PpmEmitter {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir: dir.as_ref().to_path_buf() })
    }
}

impl Emitter for PpmEmitter {
    fn emit(&mut self, frame: &Frame, epoch: u32, batch: u32) -> io::Result<()> {
        let path = self.dir.join(frame_filename(epoch, batch, "ppm"));
        let mut file = File::create(&path)?;
        writeln!(file, "P6")?;
        writeln!(file, "{} {}", frame.width, frame.height)?;
        writeln!(file, "255")?;
        file.write_all(&frame.pixels)?;
        Ok(())
    }
}

struct EmitJob {
    frame: Frame,
    epoch: u32,
    batch: u32,
}

/// Runs an inner emitter on a worker thread. `emit` only queues the owned
/// snapshot; write errors are logged by the worker and their count comes
/// back from `finish`.
pub struct AsyncEmitter {
    tx: Option<Sender<EmitJob>>,
    handle: Option<JoinHandle<u64>>,
}

impl AsyncEmitter {
    pub fn new(mut inner: Box<dyn Emitter>) -> Self {
        let (tx, rx) = mpsc::channel::<EmitJob>();
        let handle = thread::spawn(move || {
            let mut failures = 0u64;
            for job in rx {
                if let Err(e) = inner.emit(&job.frame, job.epoch, job.batch) {
                    eprintln!(
                        "Warning: could not write frame {}: {}",
                        frame_filename(job.epoch, job.batch, "*"),
                        e
                    );
                    failures += 1;
                }
            }
            match inner.finish() {
                Ok(deferred) => failures += deferred,
                Err(e) => {
                    eprintln!("Warning: emitter flush failed: {}", e);
                    failures += 1;
                }
            }
            failures
        });
        Self { tx: Some(tx), handle: Some(handle) }
    }
}

impl Emitter for AsyncEmitter {
    fn emit(&mut self, frame: &Frame, epoch: u32, batch: u32) -> io::Result<()> {
        let job = EmitJob { frame: frame.clone(), epoch, batch };
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame writer thread is gone")),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "emitter already finished")),
        }
    }

    fn finish(&mut self) -> io::Result<u64> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "frame writer thread panicked")),
            None => Ok(0),
        }
    }
}

impl Drop for AsyncEmitter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
