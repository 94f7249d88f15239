use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Read tee that advances a progress bar as flatfile bytes stream by.
pub struct ProgressReader<R> {
    inner: R,
    progress: ProgressBar,
}

impl<R: std::io::Read> ProgressReader<R> {
    pub fn new(inner: R, progress: ProgressBar) -> Self {
        Self { inner, progress }
    }
}

impl<R: std::io::Read> std::io::Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.inc(n as u64);
        Ok(n)
    }
}

#[derive(Default)]
pub struct Feedback {
    multi: MultiProgress,
}

impl Feedback {
    pub fn spinner(&self, message: &'static str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}").unwrap(),
        );
        pb.set_message(message);
        self.multi.add(pb)
    }

    pub fn flatfile_bar(&self, total_bytes: u64) -> ProgressBar {
        let pb = ProgressBar::new(total_bytes);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
        );
        self.multi.add(pb)
    }
}
