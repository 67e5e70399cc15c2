//! Producer/consumer pipeline between the sensor and the storage task.
//!
//! One bounded FIFO channel connects exactly one producer (sensor poll on
//! a fixed period) to one consumer (persist + sync per record). The
//! producer side never blocks: a full queue drops the fresh sample and
//! counts it, preferring freshness over completeness. The consumer blocks
//! until a record arrives.
//!
//! Both loops are fail-stop: the first error ends the loop and is handed
//! back as an explicit fault value, so the caller (firmware task or test
//! harness) can observe the terminal state instead of a silent spin.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embedded_hal_async::delay::DelayNs;
use portable_atomic::{AtomicU32, Ordering};

use crate::record::{Measurements, SampleRecord};

/// One full sensor measurement cycle: trigger, wait, compensate.
pub trait SampleSource {
    type Error;

    fn sample(&mut self) -> Result<Measurements, Self::Error>;
}

/// Durable destination for records: append one, then make it stick.
pub trait RecordSink {
    type Error;

    fn append(&mut self, record: &SampleRecord) -> Result<(), Self::Error>;
    fn sync(&mut self) -> Result<(), Self::Error>;
}

/// Terminal state of the producer loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProducerFault<E> {
    /// A sensor poll cycle failed.
    Sample(E),
}

/// Terminal state of the consumer loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConsumerFault<E> {
    /// Appending a record to the sink failed.
    Persist(E),
    /// The post-append sync failed.
    Sync(E),
}

/// Sample on a fixed period and push into the queue. Runs until the
/// sensor fails; the returned fault is the producer's terminal state.
///
/// `now_ms` supplies the monotonic timestamp stamped on each record at
/// production time. `dropped` counts samples discarded against a full
/// queue; it is never reset here.
pub async fn run_producer<S, M, D, const N: usize>(
    source: &mut S,
    queue: &Channel<M, SampleRecord, N>,
    delay: &mut D,
    mut now_ms: impl FnMut() -> u64,
    dropped: &AtomicU32,
    poll_interval_ms: u32,
) -> ProducerFault<S::Error>
where
    S: SampleSource,
    M: RawMutex,
    D: DelayNs,
{
    loop {
        let readings = match source.sample() {
            Ok(readings) => readings,
            Err(e) => return ProducerFault::Sample(e),
        };
        let record = SampleRecord {
            timestamp_ms: now_ms(),
            readings,
        };
        if queue.try_send(record).is_err() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
        delay.delay_ms(poll_interval_ms).await;
    }
}

/// Drain the queue into the sink, one append + sync per record, in FIFO
/// order. Blocks indefinitely while the queue is empty. Runs until the
/// sink fails; the returned fault is the consumer's terminal state.
pub async fn run_consumer<K, M, const N: usize>(
    sink: &mut K,
    queue: &Channel<M, SampleRecord, N>,
) -> ConsumerFault<K::Error>
where
    K: RecordSink,
    M: RawMutex,
{
    loop {
        let record = queue.receive().await;
        if let Err(e) = sink.append(&record) {
            return ConsumerFault::Persist(e);
        }
        if let Err(e) = sink.sync() {
            return ConsumerFault::Sync(e);
        }
    }
}
