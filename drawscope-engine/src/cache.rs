//! 渲染结果缓存：LRU + 存活时间淘汰，同一键同时只渲染一次。
//!
//! 已完成的结果存放在 `LruCache` 中；正在渲染的键登记在 `inflight` 表里，
//! 值为共享的 `OnceCell`，后到的调用方在该单元上等待而不是重复渲染。
//! 全局锁只在查表与登记时持有，渲染本身在锁外进行。
//!
//! 取消属于发起渲染的调用方：等待者拿到别人的 `Cancelled` 时会接管该键，用自己的渲染重来。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use drawscope_core::geometry::Bounds2D;
use drawscope_core::index::LayerFilter;
use lru::LruCache;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::debug;

use crate::errors::RenderError;
use crate::render::{RasterFormat, RenderResult};

/// 缓存键：源文件标识、请求矩形（按位比较）、画布尺寸、图层过滤与格式。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    source: String,
    bbox: [u64; 4],
    width: u32,
    height: u32,
    layers: Vec<String>,
    format: RasterFormat,
}

impl CacheKey {
    pub fn new(
        source: impl Into<String>,
        bbox: &Bounds2D,
        width: u32,
        height: u32,
        filter: &LayerFilter,
        format: RasterFormat,
    ) -> Self {
        let (min, max) = (bbox.min(), bbox.max());
        Self {
            source: source.into(),
            bbox: [min.x(), min.y(), max.x(), max.y()].map(f64::to_bits),
            width,
            height,
            layers: filter.names(),
            format,
        }
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// 稳定的文本形式，可用于派生输出文件名。
    pub fn canonical(&self) -> String {
        format!(
            "{}|{:016x}{:016x}{:016x}{:016x}|{}x{}|{}|{}",
            self.source,
            self.bbox[0],
            self.bbox[1],
            self.bbox[2],
            self.bbox[3],
            self.width,
            self.height,
            self.layers.join(","),
            self.format
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// 等待他人正在进行的渲染的次数。
    pub joined: u64,
    pub entries: usize,
    pub capacity: usize,
}

type Pending = Arc<OnceCell<Result<Arc<RenderResult>, RenderError>>>;

struct Stored {
    result: Arc<RenderResult>,
    stored_at: Instant,
}

enum Claim {
    Hit(Arc<RenderResult>),
    Pending(Pending),
}

struct State {
    entries: LruCache<CacheKey, Stored>,
    inflight: HashMap<CacheKey, Pending>,
}

pub struct RenderCache {
    state: Mutex<State>,
    max_age: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
}

impl RenderCache {
    /// `capacity` 为 0 时按 1 处理；`max_age` 为 None 时只按容量淘汰。
    pub fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(State {
                entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
                inflight: HashMap::new(),
            }),
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    /// 命中则返回缓存结果；否则执行 `render`。同一键的并发调用只有一个会真正执行，
    /// 其余等待并得到同一结果（包括同一错误）。错误不进入缓存。
    /// 例外是 `Cancelled`：它只返回给自己取消的调用方，等待者改为自己渲染。
    pub fn get_or_render<F>(&self, key: CacheKey, render: F) -> Result<Arc<RenderResult>, RenderError>
    where
        F: FnOnce() -> Result<RenderResult, RenderError>,
    {
        let mut render = Some(render);
        loop {
            let pending = match self.claim(&key) {
                Claim::Hit(result) => return Ok(result),
                Claim::Pending(pending) => pending,
            };

            let mut ran_here = false;
            let outcome = pending
                .get_or_init(|| {
                    ran_here = true;
                    match render.take() {
                        Some(render) => render().map(Arc::new),
                        None => Err(RenderError::Cancelled),
                    }
                })
                .clone();
            self.settle(&key, &pending, &outcome);

            if !ran_here && matches!(outcome, Err(RenderError::Cancelled)) {
                debug!(source = key.source(), "同键渲染被其发起方取消，改为自行渲染");
                continue;
            }
            return outcome;
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<RenderResult>> {
        let mut state = self.lock();
        self.fresh(&mut state, key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 删除某个源文件的全部缓存结果（文件变化后调用）。
    pub fn invalidate_source(&self, source: &str) {
        let mut state = self.lock();
        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(key, _)| key.source == source)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.entries.pop(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
            entries: state.entries.len(),
            capacity: state.entries.cap().get(),
        }
    }

    /// 查缓存；未命中时加入进行中的渲染，或登记一个新的。
    fn claim(&self, key: &CacheKey) -> Claim {
        let mut state = self.lock();
        if let Some(result) = self.fresh(&mut state, key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Claim::Hit(result);
        }
        match state.inflight.get(key) {
            Some(pending) => {
                self.joined.fetch_add(1, Ordering::Relaxed);
                debug!(source = key.source(), "等待进行中的同键渲染");
                Claim::Pending(Arc::clone(pending))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let pending: Pending = Arc::new(OnceCell::new());
                state.inflight.insert(key.clone(), Arc::clone(&pending));
                Claim::Pending(pending)
            }
        }
    }

    /// 已完成的登记项从进行中表移除，成功结果写入缓存。只处理仍指向 `pending` 的登记。
    fn settle(&self, key: &CacheKey, pending: &Pending, outcome: &Result<Arc<RenderResult>, RenderError>) {
        let mut state = self.lock();
        let current = state
            .inflight
            .get(key)
            .is_some_and(|slot| Arc::ptr_eq(slot, pending));
        if !current {
            return;
        }
        state.inflight.remove(key);
        if let Ok(result) = outcome {
            state.entries.put(
                key.clone(),
                Stored {
                    result: Arc::clone(result),
                    stored_at: Instant::now(),
                },
            );
        }
    }

    fn fresh(&self, state: &mut State, key: &CacheKey) -> Option<Arc<RenderResult>> {
        let expired = match state.entries.get(key) {
            None => return None,
            Some(stored) => match self.max_age {
                Some(max_age) => stored.stored_at.elapsed() >= max_age,
                None => false,
            },
        };
        if expired {
            state.entries.pop(key);
            return None;
        }
        state.entries.get(key).map(|stored| Arc::clone(&stored.result))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RenderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCache")
            .field("max_age", &self.max_age)
            .field("stats", &self.stats())
            .finish()
    }
}
