use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LookupStats {
    pub hits: u32,
    pub misses: u32,
    pub cache_hits: u32,
    pub total_time: Duration,
}

impl LookupStats {
    pub fn avg_ms(&self) -> f64 {
        let n = self.hits + self.misses;
        if n == 0 {
            return 0.0;
        }
        self.total_time.as_secs_f64() * 1000.0 / n as f64
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct EngineStats {
    pub success: u32,
    pub failure: u32,
    pub total_time: Duration,
}

/// Performance counters for one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunStats {
    pub image: LookupStats,
    pub text: LookupStats,
    pub engines: BTreeMap<&'static str, EngineStats>,
}

impl RunStats {
    pub fn record_lookup(&mut self, text: bool, found: bool, elapsed: Duration) {
        let s = if text { &mut self.text } else { &mut self.image };
        if found {
            s.hits += 1;
        } else {
            s.misses += 1;
        }
        s.total_time += elapsed;
    }

    pub fn record_cache_hit(&mut self, text: bool) {
        if text {
            self.text.cache_hits += 1;
        } else {
            self.image.cache_hits += 1;
        }
    }

    pub fn record_engine(&mut self, engine: &'static str, success: bool, elapsed: Duration) {
        let e = self.engines.entry(engine).or_default();
        if success {
            e.success += 1;
        } else {
            e.failure += 1;
        }
        e.total_time += elapsed;
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "image {}/{} hit (cache {}, avg {:.0}ms), text {}/{} hit (cache {}, avg {:.0}ms)",
            self.image.hits,
            self.image.hits + self.image.misses,
            self.image.cache_hits,
            self.image.avg_ms(),
            self.text.hits,
            self.text.hits + self.text.misses,
            self.text.cache_hits,
            self.text.avg_ms(),
        )?;
        for (name, e) in &self.engines {
            write!(f, ", {} {}ok/{}fail {}ms", name, e.success, e.failure, e.total_time.as_millis())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line() {
        let mut s = RunStats::default();
        s.record_lookup(false, true, Duration::from_millis(10));
        s.record_lookup(false, false, Duration::from_millis(30));
        s.record_cache_hit(false);
        s.record_engine("tesseract", false, Duration::from_millis(5));
        assert_eq!(s.image.avg_ms(), 20.0);
        let line = s.to_string();
        assert!(line.starts_with("image 1/2 hit (cache 1, avg 20ms)"));
        assert!(line.ends_with("tesseract 0ok/1fail 5ms"));
    }
}
