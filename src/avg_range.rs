const WINDOW: usize = 20;

/// Moving average of transfer speed over the last few progress reports.
pub struct MovingAverage {
    window_bytes: [u64; WINDOW],
    window_millis: [u64; WINDOW],
    index: usize,
    high_water: usize,
}

impl MovingAverage {
    pub fn new() -> Self {
        Self {
            window_bytes: [0; WINDOW],
            window_millis: [0; WINDOW],
            index: 0,
            high_water: 0,
        }
    }

    pub fn add(&mut self, bytes: u64, millis: u64) {
        self.window_bytes[self.index] = bytes;
        self.window_millis[self.index] = millis;
        self.index = (self.index + 1) % WINDOW;
        if self.high_water < WINDOW {
            self.high_water += 1;
        }
    }

    /// Bytes per second, 0 until some time has been recorded.
    pub fn bytes_per_second(&self) -> f64 {
        let sum_bytes: u64 = self.window_bytes[..self.high_water].iter().sum();
        let sum_millis: u64 = self.window_millis[..self.high_water].iter().sum();
        if sum_millis == 0 {
            return 0f64;
        }
        sum_bytes as f64 * 1000f64 / sum_millis as f64
    }
}
