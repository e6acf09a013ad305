use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};

use crate::annotate::{self, MarkedRegion};
use crate::config::Config;
use crate::detector::{self, TemplateMatch};

/// A needle decoded once at startup and reused against every haystack.
pub struct Needle {
    pub path: PathBuf,
    pub image: RgbImage,
}

impl Needle {
    pub fn file_name(&self) -> String {
        display_name(&self.path)
    }
}

/// Result of searching one haystack for one needle.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    Found { location: TemplateMatch, output: PathBuf },
    NotFound { best: TemplateMatch },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairResult {
    pub needle: PathBuf,
    pub haystack: PathBuf,
    pub outcome: PairOutcome,
}

/// Everything a run did, in processing order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub pairs: Vec<PairResult>,
    /// Files in either input folder that could not be decoded
    pub skipped: Vec<PathBuf>,
}

impl BatchReport {
    pub fn outputs(&self) -> Vec<&Path> {
        self.pairs
            .iter()
            .filter_map(|p| match &p.outcome {
                PairOutcome::Found { output, .. } => Some(output.as_path()),
                PairOutcome::NotFound { .. } => None,
            })
            .collect()
    }

    pub fn match_count(&self) -> usize {
        self.outputs().len()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Encoder for a result file: taken from its extension, PNG when the extension is
/// missing or unknown.
fn output_format(path: &Path) -> ImageFormat {
    ImageFormat::from_path(path).unwrap_or(ImageFormat::Png)
}

/// Entries of `dir` sorted by file name, so repeated runs visit files in the same order.
/// Subdirectories are kept; they fail to decode and get reported like any unreadable file.
pub fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read entry in {}", dir.display()))?;
    files.sort();
    Ok(files)
}

/// Decode every needle up front. Unreadable needles are reported and left out of the run.
pub fn load_needles(dir: &Path, skipped: &mut Vec<PathBuf>) -> Result<Vec<Needle>> {
    let mut needles = Vec::new();

    for path in list_image_files(dir)? {
        match detector::load_image(&path) {
            Ok(image) => {
                tracing::debug!(
                    "loaded needle {} ({}x{})",
                    path.display(),
                    image.width(),
                    image.height()
                );
                needles.push(Needle { path, image });
            }
            Err(e) => {
                tracing::warn!(
                    "Error: unable to read the image {}: {e}",
                    display_name(&path)
                );
                skipped.push(path);
            }
        }
    }

    Ok(needles)
}

/// Search one haystack for one needle and, on a hit, write the annotated copy.
pub fn process_pair(
    haystack_path: &Path,
    haystack: &RgbImage,
    needle: &Needle,
    config: &Config,
) -> Result<PairOutcome> {
    let best = detector::find_best_match(haystack, &needle.image).with_context(|| {
        format!(
            "template matching failed for needle {} in haystack {}",
            needle.file_name(),
            display_name(haystack_path)
        )
    })?;

    if !best.is_match(config.threshold) {
        tracing::info!(
            "Needle {} not found in haystack {} (best score {:.4}).",
            needle.file_name(),
            display_name(haystack_path),
            best.score
        );
        return Ok(PairOutcome::NotFound { best });
    }

    tracing::info!(
        "Found needle {} in haystack {} at ({}, {}) score={:.4}.",
        needle.file_name(),
        display_name(haystack_path),
        best.x,
        best.y,
        best.score
    );

    let region = MarkedRegion::from_match(&best, needle.image.width(), needle.image.height());
    let result = annotate::annotate(haystack, &region);

    let output = config
        .results_dir
        .join(annotate::result_file_name(&needle.path, haystack_path));
    result
        .save_with_format(&output, output_format(&output))
        .with_context(|| format!("failed to write {}", output.display()))?;

    Ok(PairOutcome::Found {
        location: best,
        output,
    })
}

/// Match every needle against every haystack.
///
/// Unreadable images are skipped. Anything else (missing folders, a needle larger than
/// its haystack, a failed write) aborts the run; files written before that stay on disk.
pub fn run_batch(config: &Config) -> Result<BatchReport> {
    std::fs::create_dir_all(&config.results_dir)
        .with_context(|| format!("failed to create {}", config.results_dir.display()))?;

    let mut report = BatchReport::default();
    let needles = load_needles(&config.needles_dir, &mut report.skipped)?;
    let haystack_files = list_image_files(&config.haystacks_dir)?;

    tracing::info!(
        "searching {} haystack file(s) for {} needle(s), threshold {:.2}",
        haystack_files.len(),
        needles.len(),
        config.threshold
    );

    for haystack_path in haystack_files {
        let haystack = match detector::load_image(&haystack_path) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(
                    "Error: unable to read the image {}: {e}",
                    display_name(&haystack_path)
                );
                report.skipped.push(haystack_path);
                continue;
            }
        };

        for needle in &needles {
            let outcome = process_pair(&haystack_path, &haystack, needle, config)?;
            report.pairs.push(PairResult {
                needle: needle.path.clone(),
                haystack: haystack_path.clone(),
                outcome,
            });
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn textured(w: u32, h: u32, seed: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                ((x * x * 7 + y * 13 + x * y * 3 + seed) % 256) as u8,
                ((x * 31 + y * y * 5 + 17 + seed * 3) % 256) as u8,
                ((x * y * 11 + x * 3 + y * 29 + 90) % 256) as u8,
            ])
        })
    }

    fn with_needle(needle: &RgbImage, w: u32, h: u32, left: u32, top: u32) -> RgbImage {
        let mut canvas = RgbImage::new(w, h);
        for (x, y, p) in needle.enumerate_pixels() {
            canvas.put_pixel(left + x, top + y, *p);
        }
        canvas
    }

    /// Lays out needles/ and haystacks/ under a temp dir and returns its config.
    fn setup() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_base_dir(dir.path());
        std::fs::create_dir_all(&config.needles_dir).unwrap();
        std::fs::create_dir_all(&config.haystacks_dir).unwrap();
        (dir, config)
    }

    fn sorted_results(config: &Config) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&config.results_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_list_image_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.png", "a.png", "b.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = list_image_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| display_name(p)).collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.png"]);
    }

    #[test]
    fn test_output_format_follows_extension() {
        assert_eq!(output_format(Path::new("a_b.jpg")), ImageFormat::Jpeg);
        assert_eq!(output_format(Path::new("a_b.png")), ImageFormat::Png);
        assert_eq!(output_format(Path::new("a_noext")), ImageFormat::Png);
        assert_eq!(output_format(Path::new("a_b.unknownext")), ImageFormat::Png);
    }

    #[test]
    fn test_list_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_image_files(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_match_writes_annotated_result() {
        let (_dir, config) = setup();
        let needle = textured(10, 8, 0);
        needle.save(config.needles_dir.join("logo.png")).unwrap();
        with_needle(&needle, 64, 48, 20, 10)
            .save(config.haystacks_dir.join("page.png"))
            .unwrap();

        let report = run_batch(&config).unwrap();

        assert_eq!(report.pairs.len(), 1);
        let PairOutcome::Found { location, output } = &report.pairs[0].outcome else {
            panic!("expected a match, got {:?}", report.pairs[0].outcome);
        };
        assert_eq!((location.x, location.y), (20, 10));
        assert!(location.score >= 0.8);
        assert_eq!(output, &config.results_dir.join("logo_page.png"));

        let written = image::open(output).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (64, 48));
        // Inside the kept region (away from the outline) pixels come from the haystack.
        assert_eq!(written.get_pixel(24, 13), needle.get_pixel(4, 3));
        // Outside the kept region everything is black.
        assert_eq!(*written.get_pixel(50, 40), Rgb([0, 0, 0]));
        assert_eq!(*written.get_pixel(21, 10), annotate::OUTLINE_COLOR);
    }

    #[test]
    fn test_no_match_writes_nothing() {
        let (_dir, config) = setup();
        textured(10, 8, 0).save(config.needles_dir.join("logo.png")).unwrap();
        RgbImage::from_pixel(64, 48, Rgb([30, 60, 90]))
            .save(config.haystacks_dir.join("blank.png"))
            .unwrap();

        let report = run_batch(&config).unwrap();

        assert_eq!(report.pairs.len(), 1);
        assert!(matches!(report.pairs[0].outcome, PairOutcome::NotFound { best } if best.score < 0.8));
        assert_eq!(report.match_count(), 0);
        assert!(config.results_dir.is_dir());
        assert!(sorted_results(&config).is_empty());
    }

    #[test]
    fn test_unreadable_files_are_skipped() {
        let (_dir, config) = setup();
        let needle = textured(10, 8, 0);
        needle.save(config.needles_dir.join("good.png")).unwrap();
        std::fs::write(config.needles_dir.join("bad.png"), b"not an image").unwrap();
        std::fs::write(config.haystacks_dir.join("a_broken.png"), b"garbage").unwrap();
        with_needle(&needle, 50, 40, 5, 5)
            .save(config.haystacks_dir.join("b_scene.png"))
            .unwrap();

        let report = run_batch(&config).unwrap();

        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.contains(&config.needles_dir.join("bad.png")));
        assert!(report.skipped.contains(&config.haystacks_dir.join("a_broken.png")));
        assert_eq!(report.pairs.len(), 1);
        assert_eq!(sorted_results(&config), vec!["good_b_scene.png"]);
    }

    #[test]
    fn test_misnamed_haystacks_are_matched() {
        let (_dir, config) = setup();
        let needle = textured(10, 8, 0);
        needle.save(config.needles_dir.join("logo.png")).unwrap();

        let scratch = config.base_dir.join("scene.png");
        with_needle(&needle, 48, 40, 5, 5).save(&scratch).unwrap();
        let png_bytes = std::fs::read(&scratch).unwrap();
        std::fs::write(config.haystacks_dir.join("shot.jpg"), &png_bytes).unwrap();
        std::fs::write(config.haystacks_dir.join("noext"), &png_bytes).unwrap();

        let report = run_batch(&config).unwrap();

        assert!(report.skipped.is_empty(), "skipped: {:?}", report.skipped);
        assert_eq!(report.pairs.len(), 2);
        for pair in &report.pairs {
            let PairOutcome::Found { location, .. } = &pair.outcome else {
                panic!("expected a match, got {:?}", pair.outcome);
            };
            assert_eq!((location.x, location.y), (5, 5));
        }
        assert_eq!(sorted_results(&config), vec!["logo_noext", "logo_shot.jpg"]);
    }

    #[test]
    fn test_every_pair_is_processed() {
        let (_dir, config) = setup();
        let first = textured(9, 7, 0);
        let second = textured(9, 7, 101);
        first.save(config.needles_dir.join("first.png")).unwrap();
        second.save(config.needles_dir.join("second.png")).unwrap();
        with_needle(&first, 40, 40, 3, 4)
            .save(config.haystacks_dir.join("one.png"))
            .unwrap();
        with_needle(&second, 40, 40, 20, 15)
            .save(config.haystacks_dir.join("two.png"))
            .unwrap();

        let report = run_batch(&config).unwrap();

        assert_eq!(report.pairs.len(), 4);
        // Haystacks are the outer loop.
        assert_eq!(report.pairs[0].haystack, config.haystacks_dir.join("one.png"));
        assert_eq!(report.pairs[1].haystack, config.haystacks_dir.join("one.png"));
        assert_eq!(report.pairs[2].haystack, config.haystacks_dir.join("two.png"));
        let results = sorted_results(&config);
        assert!(results.contains(&"first_one.png".to_string()));
        assert!(results.contains(&"second_two.png".to_string()));
    }

    #[test]
    fn test_runs_are_deterministic() {
        let (_dir, config) = setup();
        let needle = textured(11, 6, 7);
        needle.save(config.needles_dir.join("n.png")).unwrap();
        with_needle(&needle, 45, 35, 12, 9)
            .save(config.haystacks_dir.join("h.png"))
            .unwrap();

        run_batch(&config).unwrap();
        let first_names = sorted_results(&config);
        let first = std::fs::read(config.results_dir.join("n_h.png")).unwrap();

        std::fs::remove_dir_all(&config.results_dir).unwrap();
        run_batch(&config).unwrap();

        assert_eq!(sorted_results(&config), first_names);
        let second = std::fs::read(config.results_dir.join("n_h.png")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_oversized_needle_aborts_run() {
        let (_dir, config) = setup();
        textured(30, 30, 0).save(config.needles_dir.join("big.png")).unwrap();
        textured(10, 10, 0).save(config.haystacks_dir.join("small.png")).unwrap();

        let err = run_batch(&config).unwrap_err();
        assert!(err.to_string().contains("template matching failed"), "{err:#}");
    }

    #[test]
    fn test_missing_haystacks_dir_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_base_dir(dir.path());
        std::fs::create_dir_all(&config.needles_dir).unwrap();

        assert!(run_batch(&config).is_err());
    }
}
