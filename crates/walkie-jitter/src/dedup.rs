/// Sliding-window duplicate-sequence detector backed by a 128-slot bitmap.
///
/// Grounded on the sliding acceptance window idea in `neteq`'s packet buffer
/// staleness handling.
#[derive(Debug)]
pub struct DedupFilter {
    window: [bool; Self::WINDOW],
    latest: Option<u32>,
}

impl DedupFilter {
    const WINDOW: usize = 128;

    pub fn new() -> Self {
        Self {
            window: [false; Self::WINDOW],
            latest: None,
        }
    }

    fn slot(seq: u32) -> usize {
        (seq % Self::WINDOW as u32) as usize
    }

    /// Returns true iff `seq` is within the window and has not been seen
    /// before; marks it seen and advances the window if `seq` is newer than
    /// anything seen so far.
    pub fn receive(&mut self, seq: u32) -> bool {
        let Some(latest) = self.latest else {
            self.latest = Some(seq);
            self.window[Self::slot(seq)] = true;
            return true;
        };

        if seq <= latest && latest - seq >= Self::WINDOW as u32 {
            return false;
        }

        if seq > latest {
            let diff = seq - latest;
            if diff >= Self::WINDOW as u32 {
                self.window = [false; Self::WINDOW];
            } else {
                let mut s = latest.wrapping_add(1);
                for _ in 0..diff {
                    self.window[Self::slot(s)] = false;
                    s = s.wrapping_add(1);
                }
            }
            self.latest = Some(seq);
        }

        let slot = Self::slot(seq);
        if self.window[slot] {
            false
        } else {
            self.window[slot] = true;
            true
        }
    }

    /// True iff `seq` is within the window and its bit is set.
    pub fn saw(&self, seq: u32) -> bool {
        let Some(latest) = self.latest else {
            return false;
        };
        if seq > latest || latest - seq >= Self::WINDOW as u32 {
            return false;
        }
        self.window[Self::slot(seq)]
    }

    /// Population count over window size — acceptance density.
    pub fn receive_rate(&self) -> f64 {
        self.window.iter().filter(|&&b| b).count() as f64 / Self::WINDOW as f64
    }

    pub fn latest(&self) -> Option<u32> {
        self.latest
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ever_call_is_always_in_window() {
        let mut d = DedupFilter::new();
        assert!(d.receive(9_999));
    }

    #[test]
    fn receive_returns_false_for_duplicates() {
        let mut d = DedupFilter::new();
        assert!(d.receive(1));
        assert!(!d.receive(1));
    }

    #[test]
    fn too_old_is_rejected() {
        let mut d = DedupFilter::new();
        d.receive(200);
        assert!(!d.receive(200 - 128));
    }

    #[test]
    fn advance_by_window_wipes_everything() {
        let mut d = DedupFilter::new();
        d.receive(0);
        assert!(d.receive(128));
        assert!(!d.saw(0));
    }

    #[test]
    fn advance_by_one_less_than_window_wipes_only_slice() {
        let mut d = DedupFilter::new();
        d.receive(0);
        d.receive(1);
        assert!(d.receive(127));
        // 0 and 1 were actually received and stay within the [0, 127] window.
        assert!(d.saw(0));
        assert!(d.saw(1));
        // Everything in between was never received, so its slot reads unseen.
        assert!(!d.saw(50));
    }

    #[test]
    fn latest_minus_127_returns_false_iff_already_seen() {
        let mut d = DedupFilter::new();
        d.receive(200);
        assert!(d.receive(73)); // 200-127 = 73, not yet seen -> accepted
        assert!(!d.receive(73)); // now seen -> rejected
    }

    #[test]
    fn receive_rate_is_population_over_window() {
        let mut d = DedupFilter::new();
        for seq in 0..10 {
            d.receive(seq);
        }
        assert!((d.receive_rate() - 10.0 / 128.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_storm_receive_rate_is_roughly_one_third() {
        let mut d = DedupFilter::new();
        let mut accepted = 0;
        let mut total = 0;
        for seq in 0..60u32 {
            for _ in 0..3 {
                total += 1;
                if d.receive(seq) {
                    accepted += 1;
                }
            }
        }
        let ratio = accepted as f64 / total as f64;
        assert!((ratio - 1.0 / 3.0).abs() < 0.01);
    }
}
