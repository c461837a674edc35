//! 图纸只读索引：为每个实体预先计算范围、图层与可读性相关属性。

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::document::{Document, Entity, EntityId, EntityKind};
use crate::geometry::Bounds2D;

/// 索引内部的图层编号，对应 `DrawingIndex::layer_name`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u32);

impl LayerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct IndexedEntity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub layer: LayerId,
    pub bbox: Bounds2D,
    pub text_height: Option<f64>,
    pub stroke_width: Option<f64>,
    slot: usize,
}

/// 图层白名单。未指定或列表为空时放行全部图层，名称精确匹配。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LayerFilter(Option<BTreeSet<String>>);

impl LayerFilter {
    pub fn all() -> Self {
        Self(None)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        if set.is_empty() { Self(None) } else { Self(Some(set)) }
    }

    pub fn from_option(names: Option<&[String]>) -> Self {
        match names {
            Some(names) => Self::from_names(names.iter().cloned()),
            None => Self::all(),
        }
    }

    #[inline]
    pub fn is_all(&self) -> bool {
        self.0.is_none()
    }

    #[inline]
    pub fn matches(&self, layer: &str) -> bool {
        match &self.0 {
            Some(set) => set.contains(layer),
            None => true,
        }
    }

    /// 排序后的图层名称，用于构造缓存键；放行全部时为空。
    pub fn names(&self) -> Vec<String> {
        self.0
            .as_ref()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// 图纸范围。零实体时为 `Empty`，宽或高为零时为退化状态，两者都不是错误。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawingBounds {
    Empty,
    Extent(Bounds2D),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsState {
    Empty,
    Degenerate,
    Normal,
}

impl DrawingBounds {
    #[inline]
    pub fn extent(&self) -> Option<Bounds2D> {
        match self {
            DrawingBounds::Empty => None,
            DrawingBounds::Extent(bounds) => Some(*bounds),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, DrawingBounds::Empty)
    }

    pub fn is_degenerate(&self) -> bool {
        match self {
            DrawingBounds::Empty => false,
            DrawingBounds::Extent(bounds) => bounds.width() <= 0.0 || bounds.height() <= 0.0,
        }
    }

    pub fn state(&self) -> BoundsState {
        if self.is_empty() {
            BoundsState::Empty
        } else if self.is_degenerate() {
            BoundsState::Degenerate
        } else {
            BoundsState::Normal
        }
    }
}

/// 解析后的图纸加上逐实体的预计算属性。构建后只读，可在线程间共享。
#[derive(Debug)]
pub struct DrawingIndex {
    document: Document,
    entries: Vec<IndexedEntity>,
    layer_names: Vec<String>,
    unbounded: usize,
}

impl DrawingIndex {
    pub fn build(document: Document) -> Self {
        let mut layer_names = Vec::new();
        let mut layer_lookup: HashMap<String, LayerId> = HashMap::new();
        let mut entries = Vec::with_capacity(document.entity_count());
        let mut unbounded = 0;

        for (slot, (id, entity)) in document.entities().enumerate() {
            let Some(bbox) = document.entity_bounds(entity) else {
                unbounded += 1;
                continue;
            };
            if !bbox.min().as_vec2().is_finite() || !bbox.max().as_vec2().is_finite() {
                unbounded += 1;
                continue;
            }
            let name = entity.layer_name();
            let layer = match layer_lookup.get(name) {
                Some(layer) => *layer,
                None => {
                    let layer = LayerId(layer_names.len() as u32);
                    layer_names.push(name.to_string());
                    layer_lookup.insert(name.to_string(), layer);
                    layer
                }
            };
            entries.push(IndexedEntity {
                id: *id,
                kind: entity.kind(),
                layer,
                bbox,
                text_height: entity.text_height(),
                stroke_width: entity.stroke_width(),
                slot,
            });
        }

        Self {
            document,
            entries,
            layer_names,
            unbounded,
        }
    }

    #[inline]
    pub fn document(&self) -> &Document {
        &self.document
    }

    #[inline]
    pub fn entries(&self) -> &[IndexedEntity] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 无法计算范围而未进入索引的实体数。
    #[inline]
    pub fn unbounded_count(&self) -> usize {
        self.unbounded
    }

    #[inline]
    pub fn layer_name(&self, layer: LayerId) -> &str {
        &self.layer_names[layer.index()]
    }

    /// 含实体的图层名称，按名称排序。
    pub fn layer_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.layer_names.iter().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn passes(&self, entry: &IndexedEntity, filter: &LayerFilter) -> bool {
        filter.matches(self.layer_name(entry.layer))
    }

    pub fn filtered<'a>(&'a self, filter: &'a LayerFilter) -> impl Iterator<Item = &'a IndexedEntity> + 'a {
        self.entries.iter().filter(move |entry| self.passes(entry, filter))
    }

    /// 与矩形相交（含边界接触）且通过图层过滤的实体。
    pub fn query<'a>(
        &'a self,
        rect: Bounds2D,
        filter: &'a LayerFilter,
    ) -> impl Iterator<Item = &'a IndexedEntity> + 'a {
        self.filtered(filter).filter(move |entry| entry.bbox.intersects(&rect))
    }

    /// 过滤后实体的最紧包围范围。
    pub fn bounds(&self, filter: &LayerFilter) -> DrawingBounds {
        let mut bounds = Bounds2D::empty();
        for entry in self.filtered(filter) {
            bounds.include_bounds(&entry.bbox);
        }
        if bounds.is_empty() {
            DrawingBounds::Empty
        } else {
            DrawingBounds::Extent(bounds)
        }
    }

    pub fn entity_of(&self, entry: &IndexedEntity) -> Option<&Entity> {
        self.document.entity_at(entry.slot).map(|(_, entity)| entity)
    }
}
