//! Per-CPU perf buffers as event sources

use async_trait::async_trait;
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::MapData;
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::{Bytes, BytesMut};
use sockwatch_core::config::StreamerConfig;
use sockwatch_core::streamer::EventSource;
use sockwatch_core::{SourceError, StartError};
use tracing::debug;

/// Reads one CPU's perf ring
pub struct PerfBufferSource {
    cpu: u32,
    buffer: AsyncPerfEventArrayBuffer<MapData>,
    scratch: Vec<BytesMut>,
    capacity: usize,
}

impl PerfBufferSource {
    pub fn new(
        cpu: u32,
        buffer: AsyncPerfEventArrayBuffer<MapData>,
        buffer_count: usize,
        capacity: usize,
    ) -> Self {
        let scratch = (0..buffer_count)
            .map(|_| BytesMut::with_capacity(capacity))
            .collect();
        Self {
            cpu,
            buffer,
            scratch,
            capacity,
        }
    }
}

#[async_trait]
impl EventSource for PerfBufferSource {
    fn name(&self) -> String {
        format!("cpu{}", self.cpu)
    }

    async fn next_batch(&mut self, out: &mut Vec<Bytes>) -> Result<u64, SourceError> {
        let events = self
            .buffer
            .read_events(&mut self.scratch)
            .await
            .map_err(|e| SourceError::Read(e.to_string()))?;

        for buf in self.scratch.iter_mut().take(events.read) {
            out.push(buf.split().freeze());
            buf.reserve(self.capacity);
        }
        Ok(events.lost as u64)
    }
}

/// Open the perf event array named in `config` on every online CPU
///
/// The array is returned alongside the sources so the caller controls when
/// it is released.
pub fn open_sources(
    ebpf: &mut Ebpf,
    config: &StreamerConfig,
) -> Result<(AsyncPerfEventArray<MapData>, Vec<Box<dyn EventSource>>), StartError> {
    let map = ebpf.take_map(&config.perf_map).ok_or_else(|| {
        StartError::Streamer(format!("{} not found in probe object", config.perf_map))
    })?;
    let mut array = AsyncPerfEventArray::try_from(map)
        .map_err(|e| StartError::Streamer(format!("{}: {}", config.perf_map, e)))?;

    let cpus = online_cpus()
        .map_err(|(what, e)| StartError::Streamer(format!("{}: {}", what, e)))?;

    let mut sources: Vec<Box<dyn EventSource>> = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let buffer = array
            .open(cpu, Some(config.page_count))
            .map_err(|e| StartError::Streamer(format!("cpu{}: {}", cpu, e)))?;
        sources.push(Box::new(PerfBufferSource::new(
            cpu,
            buffer,
            config.buffer_count,
            config.buffer_capacity,
        )));
    }
    debug!("Opened {} on {} CPUs", config.perf_map, sources.len());

    Ok((array, sources))
}
