use crate::{
    day, tokenizer::NGramTokenizer, BlockCallback, BlockQuerier, BlockRef, BlockStore, ChunkRef,
    Error, ErrorKind, Fingerprint, FingerprintBounds, FusedQuery, Output, RequestStream, Result,
    Schema,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// In-memory bloom block store keyed by tenant.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<String, Vec<Arc<MemoryBlock>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, block: MemoryBlock) -> BlockRef {
        let block_ref = block.block_ref.clone();
        let mut blocks = self.lock();
        let tenant_blocks = blocks.entry(block_ref.tenant.clone()).or_default();
        tenant_blocks.retain(|b| b.block_ref != block_ref);
        tenant_blocks.push(Arc::new(block));
        tenant_blocks.sort_by(|a, b| {
            (a.block_ref.start, a.block_ref.bounds).cmp(&(b.block_ref.start, b.block_ref.bounds))
        });
        block_ref
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<MemoryBlock>>>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn get_block_refs(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        through: DateTime<Utc>,
    ) -> Result<Vec<BlockRef>> {
        let blocks = self.lock();
        Ok(blocks
            .get(tenant)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.block_ref.start <= through && b.block_ref.end >= from)
                    .map(|b| b.block_ref.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(
        &self,
        tenant: &str,
        refs: &[BlockRef],
        callback: &mut BlockCallback<'_>,
    ) -> Result<()> {
        let resolved = {
            let blocks = self.lock();
            let tenant_blocks = blocks.get(tenant).map(Vec::as_slice).unwrap_or_default();
            refs.iter()
                .map(|r| {
                    tenant_blocks
                        .iter()
                        .find(|b| &b.block_ref == r)
                        .cloned()
                        .ok_or_else(|| {
                            Error::new(ErrorKind::Store, anyhow!("block {r} not found"))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };

        for block in resolved {
            callback(block.as_ref(), block.block_ref.bounds)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ChunkBloom {
    chunk: ChunkRef,
    tokens: HashSet<String>,
}

#[derive(Debug)]
struct SeriesBloom {
    fp: Fingerprint,
    chunks: Vec<ChunkBloom>,
}

/// A day's bloom block: series ordered by fingerprint, one token set per chunk.
#[derive(Debug)]
pub struct MemoryBlock {
    block_ref: BlockRef,
    schema: Schema,
    series: Vec<SeriesBloom>,
}

impl MemoryBlock {
    pub fn builder(tenant: impl Into<String>, day: NaiveDate, schema: Schema) -> MemoryBlockBuilder {
        MemoryBlockBuilder {
            tenant: tenant.into(),
            day,
            schema,
            bounds: None,
            series: BTreeMap::new(),
        }
    }

    pub fn block_ref(&self) -> &BlockRef {
        &self.block_ref
    }
}

#[derive(Debug)]
pub struct MemoryBlockBuilder {
    tenant: String,
    day: NaiveDate,
    schema: Schema,
    bounds: Option<FingerprintBounds>,
    series: BTreeMap<Fingerprint, Vec<ChunkBloom>>,
}

impl MemoryBlockBuilder {
    /// Index `lines` as the content of `chunk` in stream `fp`.
    pub fn chunk(mut self, fp: impl Into<Fingerprint>, chunk: ChunkRef, lines: &[&str]) -> Self {
        let tokenizer = NGramTokenizer::new(self.schema.ngram_len, self.schema.ngram_skip);
        let tokens = lines.iter().flat_map(|line| tokenizer.tokens(line)).collect();
        self.series
            .entry(fp.into())
            .or_default()
            .push(ChunkBloom { chunk, tokens });
        self
    }

    /// Override the fingerprint range the block claims; defaults to its first and last series.
    pub fn bounds(mut self, bounds: FingerprintBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn build(self) -> MemoryBlock {
        let first = self.series.keys().next().copied().unwrap_or_default();
        let last = self.series.keys().next_back().copied().unwrap_or_default();
        let bounds = self.bounds.unwrap_or(FingerprintBounds {
            min: first,
            max: last,
        });
        let (start, end) = day::day_interval(self.day);
        let checksum = self
            .series
            .iter()
            .fold(bounds.min.0 as u32 ^ bounds.max.0 as u32, |acc, (fp, chunks)| {
                acc.rotate_left(5) ^ (fp.0 as u32) ^ chunks.len() as u32
            });

        MemoryBlock {
            block_ref: BlockRef {
                tenant: self.tenant,
                start,
                end,
                bounds,
                checksum,
            },
            schema: self.schema,
            series: self
                .series
                .into_iter()
                .map(|(fp, chunks)| SeriesBloom { fp, chunks })
                .collect(),
        }
    }
}

impl BlockQuerier for MemoryBlock {
    fn schema(&self) -> Result<Schema> {
        Ok(self.schema)
    }

    fn fuse<'a>(&'a self, requests: RequestStream<'a>) -> Box<dyn FusedQuery + 'a> {
        Box::new(MemoryFusedQuery {
            block: self,
            requests,
        })
    }
}

struct MemoryFusedQuery<'a> {
    block: &'a MemoryBlock,
    requests: RequestStream<'a>,
}

impl FusedQuery for MemoryFusedQuery<'_> {
    fn run(&mut self) -> Result<()> {
        let mut cursor = 0usize;
        let mut last: Option<Fingerprint> = None;

        while let Some(first) = self.requests.next() {
            let fp = first.fp;
            if last.is_some_and(|prev| fp < prev) {
                return Err(Error::new(
                    ErrorKind::Query,
                    anyhow!("requests out of order: {fp} after {}", last.unwrap_or_default()),
                ));
            }
            last = Some(fp);

            let mut group = vec![first];
            while let Some(next) = self.requests.next_if(|r| r.fp == fp) {
                group.push(next);
            }

            while cursor < self.block.series.len() && self.block.series[cursor].fp < fp {
                cursor += 1;
            }
            let series = self.block.series.get(cursor).filter(|s| s.fp == fp);

            for req in group {
                let removals = match series {
                    None => Vec::new(),
                    Some(series) => req
                        .chunks
                        .iter()
                        .filter(|chunk| {
                            series
                                .chunks
                                .iter()
                                .find(|bloom| bloom.chunk == **chunk)
                                .is_some_and(|bloom| !matches_all(bloom, &req.searches))
                        })
                        .copied()
                        .collect(),
                };
                req.response.send(Output { fp, removals });
            }
        }
        Ok(())
    }
}

fn matches_all(bloom: &ChunkBloom, searches: &[Vec<String>]) -> bool {
    searches
        .iter()
        .all(|tokens| tokens.iter().all(|t| bloom.tokens.contains(t)))
}
