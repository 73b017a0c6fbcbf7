//! Rendering backend: the `Render` seam plus the SVG implementation.

use crate::job::JobKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

/// Rendering collaborator injected into the pool.
///
/// Implementations turn a job input into a file on disk and return its path.
/// Error text should name the underlying cause; the pool classifies failures
/// from it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Render: Send + Sync {
    async fn render(&self, kind: JobKind, input: &str, output_name: &str) -> Result<PathBuf>;
}

/// SVG renderer producing raster PNG artifacts, or TRUE vector PDF when the
/// output name asks for one.
pub struct SvgRenderer {
    output_dir: PathBuf,
}

impl SvgRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn output_path(&self, output_name: &str) -> Result<PathBuf> {
        if output_name.is_empty() || output_name.contains('/') || output_name.contains('\\') {
            anyhow::bail!("invalid output name: {:?}", output_name);
        }
        Ok(self.output_dir.join(output_name))
    }

    /// Renders SVG markup to the artifact file.
    ///
    /// # Errors
    ///
    /// - SVG parsing errors (malformed XML, unsupported features)
    /// - File I/O errors (permissions, disk full)
    /// - Rendering errors (out of memory, invalid dimensions)
    fn render_markup(&self, svg_content: &str, output_path: &Path) -> Result<()> {
        let tree = usvg::Tree::from_str(svg_content, &usvg::Options::default())
            .context("Failed to parse SVG content")?;

        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            anyhow::bail!("Invalid SVG dimensions: {}x{}", size.width(), size.height());
        }

        let is_pdf = output_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        let data = if is_pdf {
            svg2pdf::to_pdf(
                &tree,
                svg2pdf::ConversionOptions::default(),
                svg2pdf::PageOptions::default(),
            )
        } else {
            let int_size = size.to_int_size();
            let mut pixmap =
                resvg::tiny_skia::Pixmap::new(int_size.width(), int_size.height())
                    .context("Failed to allocate pixmap for SVG rasterization")?;
            resvg::render(
                &tree,
                resvg::tiny_skia::Transform::default(),
                &mut pixmap.as_mut(),
            );
            pixmap.encode_png().context("Failed to encode PNG")?
        };

        self.write_artifact(&data, output_path)?;

        info!(
            "Rendered markup: output={}, bytes={}",
            output_path.display(),
            data.len()
        );
        Ok(())
    }

    /// Copies a referenced local image into the artifact directory.
    fn render_reference(&self, reference: &str, output_path: &Path) -> Result<()> {
        let source = Path::new(reference);
        if !source.is_file() {
            anyhow::bail!("referenced file does not exist: {}", reference);
        }
        let bytes = fs::copy(source, output_path).with_context(|| {
            format!("Failed to copy {} to {}", reference, output_path.display())
        })?;
        info!(
            "Copied reference: source={}, output={}, bytes={}",
            reference,
            output_path.display(),
            bytes
        );
        Ok(())
    }

    // Writes via a temp file in the same directory so a crash mid-write
    // never leaves a truncated artifact at the final path.
    fn write_artifact(&self, data: &[u8], output_path: &Path) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.output_dir)
            .context("Failed to create temp file in artifact directory")?;
        tmp.write_all(data).context("Failed to write artifact")?;
        tmp.persist(output_path)
            .map_err(|err| err.error)
            .with_context(|| format!("Failed to persist artifact to {}", output_path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Render for SvgRenderer {
    async fn render(&self, kind: JobKind, input: &str, output_name: &str) -> Result<PathBuf> {
        let output_path = self.output_path(output_name)?;
        match kind {
            JobKind::Markup => self.render_markup(input, &output_path)?,
            JobKind::Reference => self.render_reference(input, &output_path)?,
        }
        Ok(output_path)
    }
}
