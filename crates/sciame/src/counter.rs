use tokio::time::Instant;

/// Weight of the last window in the moving average of the rates.
const EMA_ALPHA: f64 = 0.3;

/// Transfer totals and rates of a torrent, updated by its event loop.
#[derive(Debug)]
pub struct Counter {
    total_downloaded: u64,
    total_uploaded: u64,

    window_downloaded: u64,
    window_uploaded: u64,
    last_update: Instant,
    ema_download: f64,
    ema_upload: f64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: 0,
            total_uploaded: 0,
            window_downloaded: 0,
            window_uploaded: 0,
            last_update: Instant::now(),
            ema_download: 0.0,
            ema_upload: 0.0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.total_downloaded += bytes;
        self.window_downloaded += bytes;
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.total_uploaded += bytes;
        self.window_uploaded += bytes;
    }

    /// Fold the bytes since the last update into the rates.
    pub fn update_rates(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        self.apply(elapsed);
        self.last_update = now;
    }

    fn apply(&mut self, elapsed: f64) {
        let dl_rate = std::mem::take(&mut self.window_downloaded) as f64 / elapsed;
        let ul_rate = std::mem::take(&mut self.window_uploaded) as f64 / elapsed;

        self.ema_download = ema(self.ema_download, dl_rate);
        self.ema_upload = ema(self.ema_upload, ul_rate);
    }

    /// Bytes per second.
    pub fn download_rate(&self) -> u64 {
        self.ema_download as u64
    }

    /// Bytes per second.
    pub fn upload_rate(&self) -> u64 {
        self.ema_upload as u64
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded
    }

    pub fn total_uploaded(&self) -> u64 {
        self.total_uploaded
    }
}

fn ema(prev: f64, rate: f64) -> f64 {
    if prev == 0.0 {
        rate
    } else {
        EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * prev
    }
}
