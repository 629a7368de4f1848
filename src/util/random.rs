use rand::Rng;
#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Seam for the one place the suite is nondeterministic: picking a ticket
///  dispatcher among several registered for the same road.
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// uniformly distributed value in `0..upper`; `upper` must be > 0
    fn usize_below(upper: usize) -> usize;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn usize_below(upper: usize) -> usize {
        rand::thread_rng().gen_range(0..upper)
    }
}
