use std::path::{Path, PathBuf};

use image::{ImageBuffer, Rgb, RgbImage};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub const RED: [u8; 3] = [220, 10, 10];
/// Different pixels, same histogram bins as [`RED`].
pub const RED_AGAIN: [u8; 3] = [235, 30, 25];
pub const BLUE: [u8; 3] = [10, 10, 220];
pub const GREEN: [u8; 3] = [10, 220, 10];

pub fn solid(color: [u8; 3]) -> RgbImage {
    ImageBuffer::from_pixel(16, 16, Rgb(color))
}

/// Left half `left`, right half `right`.
pub fn split(left: [u8; 3], right: [u8; 3]) -> RgbImage {
    ImageBuffer::from_fn(16, 16, |x, _| if x < 8 { Rgb(left) } else { Rgb(right) })
}

/// Catalog of small PNGs with one exact-histogram duplicate and one
/// undecodable file:
///
/// ```text
/// blue.png  broken.png  green.png  mixed.png  red.png  red_again.png
/// ```
#[allow(dead_code)]
pub struct CatalogFixture {
    pub dir: TempDir,
}

#[allow(dead_code)]
impl CatalogFixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("dataset");
        std::fs::create_dir_all(&root).expect("catalog dir");
        solid(BLUE).save(root.join("blue.png")).expect("write blue");
        solid(GREEN).save(root.join("green.png")).expect("write green");
        split(RED, BLUE).save(root.join("mixed.png")).expect("write mixed");
        solid(RED).save(root.join("red.png")).expect("write red");
        solid(RED_AGAIN)
            .save(root.join("red_again.png"))
            .expect("write red_again");
        std::fs::write(root.join("broken.png"), b"definitely not a png").expect("write broken");
        std::fs::write(root.join("notes.txt"), b"ignored").expect("write notes");
        Self { dir }
    }

    pub fn catalog(&self) -> PathBuf {
        self.dir.path().join("dataset")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn image(&self, name: &str) -> PathBuf {
        self.catalog().join(name)
    }

    pub fn remove_broken(&self) {
        std::fs::remove_file(self.image("broken.png")).expect("remove broken");
    }

    /// Write a query image outside the catalog.
    pub fn query(&self, name: &str, image: &RgbImage) -> PathBuf {
        let path = self.dir.path().join(name);
        image.save(&path).expect("write query image");
        path
    }
}

#[allow(dead_code)]
pub fn identifier_of(path: &Path) -> String {
    sight_match::model::types::canonical_identifier(&path.to_string_lossy())
}
