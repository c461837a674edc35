pub mod index;
pub mod shapes;

pub mod geometry {
    use glam::{DAffine2, DVec2};
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示，坐标单位为图纸单位。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    impl From<DVec2> for Vector2 {
        fn from(value: DVec2) -> Self {
            Self(value)
        }
    }

    /// 轴对齐边界框。`empty()` 构造的实例不包含任何点，`is_empty()` 为真。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        /// 以左下角与宽高构造，对应外部接口中的 `{x, y, width, height}`。
        #[inline]
        pub fn from_origin_size(x: f64, y: f64, width: f64, height: f64) -> Self {
            Self {
                min: Point2::new(x, y),
                max: Point2::new(x + width, y + height),
            }
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        #[inline]
        pub fn width(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.x() - self.min.x()
            }
        }

        #[inline]
        pub fn height(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.y() - self.min.y()
            }
        }

        #[inline]
        pub fn area(&self) -> f64 {
            self.width() * self.height()
        }

        /// 宽或高为零（但非空）的退化范围。
        #[inline]
        pub fn is_degenerate(&self) -> bool {
            !self.is_empty() && (self.width() <= 0.0 || self.height() <= 0.0)
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            let min_vec = self.min.as_vec2().min(point.as_vec2());
            let max_vec = self.max.as_vec2().max(point.as_vec2());
            self.min = Point2::from_vec(min_vec);
            self.max = Point2::from_vec(max_vec);
        }

        pub fn include_bounds(&mut self, other: &Bounds2D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            Point2::from_vec((self.min.as_vec2() + self.max.as_vec2()) * 0.5)
        }

        /// 闭区间相交判定，边界接触视为相交。
        pub fn intersects(&self, other: &Bounds2D) -> bool {
            if self.is_empty() || other.is_empty() {
                return false;
            }
            self.min.x() <= other.max.x()
                && other.min.x() <= self.max.x()
                && self.min.y() <= other.max.y()
                && other.min.y() <= self.max.y()
        }

        pub fn intersection(&self, other: &Bounds2D) -> Option<Bounds2D> {
            if !self.intersects(other) {
                return None;
            }
            Some(Bounds2D {
                min: Point2::from_vec(self.min.as_vec2().max(other.min.as_vec2())),
                max: Point2::from_vec(self.max.as_vec2().min(other.max.as_vec2())),
            })
        }

        pub fn contains(&self, other: &Bounds2D) -> bool {
            if self.is_empty() || other.is_empty() {
                return false;
            }
            self.min.x() <= other.min.x()
                && self.min.y() <= other.min.y()
                && self.max.x() >= other.max.x()
                && self.max.y() >= other.max.y()
        }

        /// 变换四个角点后重新求包围盒。
        pub fn transformed(&self, transform: &DAffine2) -> Bounds2D {
            if self.is_empty() {
                return *self;
            }
            let mut result = Bounds2D::empty();
            for corner in [
                self.min.as_vec2(),
                DVec2::new(self.max.x(), self.min.y()),
                DVec2::new(self.min.x(), self.max.y()),
                self.max.as_vec2(),
            ] {
                result.include_point(Point2::from_vec(transform.transform_point2(corner)));
            }
            result
        }
    }
}

pub mod cancel {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// 可在线程间共享的取消标记。克隆后的实例共享同一状态。
    #[derive(Debug, Clone, Default)]
    pub struct CancelToken(Arc<AtomicBool>);

    impl CancelToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        #[inline]
        pub fn is_cancelled(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }
}

pub mod document {
    use std::collections::{BTreeMap, HashMap};
    use std::f64::consts::{FRAC_PI_2, PI, TAU};

    use glam::{DAffine2, DVec2};
    use serde::{Deserialize, Serialize};

    use crate::geometry::{Bounds2D, Point2, Vector2};

    /// 块参照允许的最大嵌套深度，防止循环引用。
    pub const MAX_BLOCK_DEPTH: usize = 8;

    /// 文字宽度估算系数（单字符宽度 / 字高）。
    pub const TEXT_WIDTH_FACTOR: f64 = 0.7;

    /// 多行文字的默认行距系数。
    pub const LINE_SPACING_FACTOR: f64 = 5.0 / 3.0;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct EntityId(u64);

    impl EntityId {
        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }
    }

    /// 实体几何类别，仅用于分类与统计，不含语义。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum EntityKind {
        Line,
        Circle,
        Arc,
        Ellipse,
        Polyline,
        Spline,
        Text,
        MText,
        Dimension,
        Insert,
        Leader,
    }

    impl EntityKind {
        pub fn as_str(self) -> &'static str {
            match self {
                EntityKind::Line => "line",
                EntityKind::Circle => "circle",
                EntityKind::Arc => "arc",
                EntityKind::Ellipse => "ellipse",
                EntityKind::Polyline => "polyline",
                EntityKind::Spline => "spline",
                EntityKind::Text => "text",
                EntityKind::MText => "mtext",
                EntityKind::Dimension => "dimension",
                EntityKind::Insert => "insert",
                EntityKind::Leader => "leader",
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum Entity {
        Line(Line),
        Circle(Circle),
        Arc(Arc),
        Ellipse(Ellipse),
        Polyline(Polyline),
        Spline(Spline),
        Text(Text),
        MText(MText),
        BlockReference(BlockReference),
        Dimension(Dimension),
        Leader(Leader),
    }

    impl Entity {
        #[inline]
        pub fn layer_name(&self) -> &str {
            match self {
                Entity::Line(line) => &line.layer,
                Entity::Circle(circle) => &circle.layer,
                Entity::Arc(arc) => &arc.layer,
                Entity::Ellipse(ellipse) => &ellipse.layer,
                Entity::Polyline(polyline) => &polyline.layer,
                Entity::Spline(spline) => &spline.layer,
                Entity::Text(text) => &text.layer,
                Entity::MText(mtext) => &mtext.layer,
                Entity::BlockReference(reference) => &reference.layer,
                Entity::Dimension(dimension) => &dimension.layer,
                Entity::Leader(leader) => &leader.layer,
            }
        }

        pub fn kind(&self) -> EntityKind {
            match self {
                Entity::Line(_) => EntityKind::Line,
                Entity::Circle(_) => EntityKind::Circle,
                Entity::Arc(_) => EntityKind::Arc,
                Entity::Ellipse(_) => EntityKind::Ellipse,
                Entity::Polyline(_) => EntityKind::Polyline,
                Entity::Spline(_) => EntityKind::Spline,
                Entity::Text(_) => EntityKind::Text,
                Entity::MText(_) => EntityKind::MText,
                Entity::BlockReference(_) => EntityKind::Insert,
                Entity::Dimension(_) => EntityKind::Dimension,
                Entity::Leader(_) => EntityKind::Leader,
            }
        }

        /// 计算实体自身的 2D 轴对齐范围。块参照依赖块定义，需经 `Document::entity_bounds` 计算。
        pub fn bounds(&self) -> Option<Bounds2D> {
            let mut bounds = Bounds2D::empty();
            match self {
                Entity::Line(line) => {
                    bounds.include_point(line.start);
                    bounds.include_point(line.end);
                }
                Entity::Circle(circle) => {
                    let radius = circle.radius.abs();
                    let center = circle.center;
                    bounds.include_point(Point2::new(center.x() - radius, center.y() - radius));
                    bounds.include_point(Point2::new(center.x() + radius, center.y() + radius));
                }
                Entity::Arc(arc) => arc_bounds(arc.center, arc.radius, arc.start_angle, arc.end_angle, &mut bounds),
                Entity::Ellipse(ellipse) => ellipse_bounds(ellipse, &mut bounds),
                Entity::Polyline(polyline) => {
                    let count = polyline.vertices.len();
                    for (i, vertex) in polyline.vertices.iter().enumerate() {
                        bounds.include_point(vertex.position);
                        let next = if i + 1 < count {
                            Some(&polyline.vertices[i + 1])
                        } else if polyline.is_closed && count > 1 {
                            Some(&polyline.vertices[0])
                        } else {
                            None
                        };
                        if let Some(next) = next {
                            bulge_bounds(vertex.position, next.position, vertex.bulge, &mut bounds);
                        }
                    }
                    if let Some(width) = polyline.width.filter(|w| *w > 0.0) {
                        if !bounds.is_empty() {
                            let half = width / 2.0;
                            bounds.include_point(Point2::new(bounds.min().x() - half, bounds.min().y() - half));
                            bounds.include_point(Point2::new(bounds.max().x() + half, bounds.max().y() + half));
                        }
                    }
                }
                Entity::Spline(spline) => {
                    for point in spline.control_points.iter().chain(spline.fit_points.iter()) {
                        bounds.include_point(*point);
                    }
                }
                Entity::Text(text) => {
                    for corner in text.frame().corners {
                        bounds.include_point(corner);
                    }
                }
                Entity::MText(mtext) => {
                    for corner in mtext.frame().corners {
                        bounds.include_point(corner);
                    }
                }
                Entity::BlockReference(reference) => {
                    bounds.include_point(reference.insert);
                    for attr in reference.attributes.iter().filter(|a| !a.is_invisible) {
                        for corner in attr.frame().corners {
                            bounds.include_point(corner);
                        }
                    }
                }
                Entity::Dimension(dimension) => {
                    for point in dimension.points() {
                        bounds.include_point(point);
                    }
                }
                Entity::Leader(leader) => {
                    for vertex in &leader.vertices {
                        bounds.include_point(*vertex);
                    }
                }
            }
            if bounds.is_empty() { None } else { Some(bounds) }
        }

        /// 实体携带的最小文字高度（图纸单位）。
        pub fn text_height(&self) -> Option<f64> {
            let height = match self {
                Entity::Text(text) => Some(text.height),
                Entity::MText(mtext) => Some(mtext.height),
                Entity::BlockReference(reference) => reference
                    .attributes
                    .iter()
                    .filter(|attr| !attr.is_invisible)
                    .map(|attr| attr.height * reference.scale_factor())
                    .reduce(f64::min),
                Entity::Dimension(dimension) => dimension.text_height,
                _ => None,
            };
            height.filter(|h| *h > 0.0 && h.is_finite())
        }

        /// 显式声明的线宽（图纸单位），未声明的细线返回 None。
        pub fn stroke_width(&self) -> Option<f64> {
            match self {
                Entity::Polyline(polyline) => polyline.width.filter(|w| *w > 0.0),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Line {
        pub start: Point2,
        pub end: Point2,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Circle {
        pub center: Point2,
        pub radius: f64,
        pub layer: String,
    }

    /// 圆弧实体，角度以弧度形式储存，逆时针为正。
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Arc {
        pub center: Point2,
        pub radius: f64,
        pub start_angle: f64,
        pub end_angle: f64,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Ellipse {
        pub center: Point2,
        pub major_axis: Vector2,
        pub ratio: f64,
        pub start_parameter: f64,
        pub end_parameter: f64,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PolylineVertex {
        pub position: Point2,
        pub bulge: f64,
    }

    impl PolylineVertex {
        #[inline]
        pub fn new(position: Point2) -> Self {
            Self {
                position,
                bulge: 0.0,
            }
        }

        #[inline]
        pub fn with_bulge(position: Point2, bulge: f64) -> Self {
            Self { position, bulge }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Polyline {
        pub vertices: Vec<PolylineVertex>,
        pub is_closed: bool,
        /// 全局线宽（LWPOLYLINE 组码 43 / POLYLINE 组码 40、41）。
        pub width: Option<f64>,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Spline {
        pub degree: i32,
        pub is_closed: bool,
        pub control_points: Vec<Point2>,
        pub fit_points: Vec<Point2>,
        pub knot_values: Vec<f64>,
        pub weights: Vec<f64>,
        pub layer: String,
    }

    /// 文字外框：四个角点按 左下、右下、右上、左上 排列。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct TextFrame {
        pub corners: [Point2; 4],
        pub height: f64,
        pub rotation: f64,
    }

    /// 按插入点、方向与对齐方式估算文字外框。
    /// `column` 0/1/2 对应 左/中/右，`row` 0/1/2 对应 顶/中/底（多行文字附着点）。
    pub fn estimate_text_frame(
        insert: Point2,
        height: f64,
        rotation: f64,
        content: &str,
        column: u8,
        row: u8,
        reference_width: Option<f64>,
    ) -> TextFrame {
        let height = height.abs();
        let lines: Vec<&str> = content.split('\n').collect();
        let longest = lines.iter().map(|line| line.chars().count()).max().unwrap_or(0).max(1);
        let width = reference_width
            .filter(|w| *w > 0.0)
            .unwrap_or(height * longest as f64 * TEXT_WIDTH_FACTOR);
        let block_height = if lines.len() > 1 {
            height + (lines.len() - 1) as f64 * height * LINE_SPACING_FACTOR
        } else {
            height
        };

        let x0 = match column {
            1 => -width / 2.0,
            2 => -width,
            _ => 0.0,
        };
        let y0 = match row {
            0 => -block_height,
            1 => -block_height / 2.0,
            _ => 0.0,
        };
        let local = [
            DVec2::new(x0, y0),
            DVec2::new(x0 + width, y0),
            DVec2::new(x0 + width, y0 + block_height),
            DVec2::new(x0, y0 + block_height),
        ];
        let rotate = DVec2::from_angle(rotation);
        let origin = insert.as_vec2();
        TextFrame {
            corners: local.map(|p| Point2::from_vec(origin + rotate.rotate(p))),
            height,
            rotation,
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Text {
        pub insert: Point2,
        pub content: String,
        pub height: f64,
        pub rotation: f64,
        pub layer: String,
    }

    impl Text {
        pub fn frame(&self) -> TextFrame {
            estimate_text_frame(self.insert, self.height, self.rotation, &self.content, 0, 2, None)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MText {
        pub insert: Point2,
        pub content: String,
        pub height: f64,
        pub reference_width: Option<f64>,
        pub direction: Vector2,
        pub attachment_point: i16,
        pub layer: String,
    }

    impl MText {
        pub fn rotation(&self) -> f64 {
            let dir = self.direction.as_vec2();
            dir.y.atan2(dir.x)
        }

        pub fn frame(&self) -> TextFrame {
            let attachment = self.attachment_point.clamp(1, 9) as u8 - 1;
            estimate_text_frame(
                self.insert,
                self.height,
                self.rotation(),
                &self.content,
                attachment % 3,
                attachment / 3,
                self.reference_width,
            )
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Attribute {
        pub tag: String,
        pub text: String,
        pub insert: Point2,
        pub height: f64,
        pub rotation: f64,
        pub is_invisible: bool,
        pub layer: String,
    }

    impl Attribute {
        pub fn frame(&self) -> TextFrame {
            estimate_text_frame(self.insert, self.height, self.rotation, &self.text, 0, 2, None)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BlockReference {
        pub name: String,
        pub insert: Point2,
        pub scale: Vector2,
        pub rotation: f64,
        pub attributes: Vec<Attribute>,
        pub layer: String,
    }

    impl BlockReference {
        /// 块坐标到世界坐标的仿射变换（不含块基点平移）。
        pub fn transform(&self) -> DAffine2 {
            DAffine2::from_scale_angle_translation(
                self.scale.as_vec2(),
                self.rotation,
                self.insert.as_vec2(),
            )
        }

        /// 等效的均匀缩放倍数，用于换算文字高度。
        pub fn scale_factor(&self) -> f64 {
            (self.scale.x() * self.scale.y()).abs().sqrt()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum DimensionKind {
        Linear,
        Aligned,
        Angular,
        Diameter,
        Radius,
        Angular3Point,
        Ordinate,
        Unknown(i16),
    }

    impl DimensionKind {
        pub fn from_flags(flags: i16) -> Self {
            match flags & 0x0F {
                0 => DimensionKind::Linear,
                1 => DimensionKind::Aligned,
                2 => DimensionKind::Angular,
                3 => DimensionKind::Diameter,
                4 => DimensionKind::Radius,
                5 => DimensionKind::Angular3Point,
                6 => DimensionKind::Ordinate,
                other => DimensionKind::Unknown(other),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Dimension {
        pub kind: DimensionKind,
        /// 匿名块名称（通常为 `*D` 开头），包含标注的图形表示。
        pub block_name: Option<String>,
        pub definition_point: Point2,
        pub text_midpoint: Point2,
        pub extension_line_origin: Option<Point2>,
        pub extension_line_end: Option<Point2>,
        pub text: Option<String>,
        pub measurement: Option<f64>,
        pub text_height: Option<f64>,
        pub text_rotation: Option<f64>,
        pub layer: String,
    }

    impl Dimension {
        pub fn points(&self) -> impl Iterator<Item = Point2> + '_ {
            [
                Some(self.definition_point),
                Some(self.text_midpoint),
                self.extension_line_origin,
                self.extension_line_end,
            ]
            .into_iter()
            .flatten()
        }

        /// 标注显示文本：优先使用覆盖文本，否则格式化测量值。
        pub fn display_text(&self) -> Option<String> {
            match (&self.text, self.measurement) {
                (Some(text), Some(value)) if text.contains("<>") => {
                    Some(text.replace("<>", &format_measurement(value)))
                }
                (Some(text), _) => Some(text.clone()),
                (None, Some(value)) => Some(format_measurement(value)),
                (None, None) => None,
            }
        }
    }

    fn format_measurement(value: f64) -> String {
        if (value - value.round()).abs() < 1e-6 {
            format!("{}", value.round() as i64)
        } else {
            format!("{value:.2}")
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Leader {
        pub vertices: Vec<Point2>,
        pub has_arrowhead: bool,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BlockDefinition {
        pub name: String,
        pub base_point: Point2,
        pub entities: Vec<Entity>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Layer {
        pub name: String,
        pub is_visible: bool,
    }

    impl Layer {
        #[inline]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                is_visible: true,
            }
        }
    }

    /// 解析后的图纸模型。创建后由 `DrawingIndex` 独占持有，只读使用。
    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct Document {
        layers: HashMap<String, Layer>,
        entities: Vec<(EntityId, Entity)>,
        next_entity_id: u64,
        blocks: HashMap<String, BlockDefinition>,
        /// 读取时跳过的实体类型及数量。
        #[serde(default)]
        skipped: BTreeMap<String, usize>,
    }

    impl Document {
        pub fn new() -> Self {
            let mut doc = Self::default();
            doc.ensure_layer("0");
            doc
        }

        pub fn ensure_layer(&mut self, name: impl AsRef<str>) {
            let key = name.as_ref();
            self.layers
                .entry(key.to_string())
                .or_insert_with(|| Layer::new(key));
        }

        pub fn add_entity(&mut self, entity: Entity) -> EntityId {
            self.ensure_layer(entity.layer_name());
            if let Entity::BlockReference(reference) = &entity {
                for attribute in &reference.attributes {
                    self.ensure_layer(&attribute.layer);
                }
            }
            let id = self.next_id();
            self.entities.push((id, entity));
            id
        }

        pub fn add_line(&mut self, start: Point2, end: Point2, layer: impl Into<String>) -> EntityId {
            self.add_entity(Entity::Line(Line {
                start,
                end,
                layer: layer.into(),
            }))
        }

        pub fn add_circle(&mut self, center: Point2, radius: f64, layer: impl Into<String>) -> EntityId {
            self.add_entity(Entity::Circle(Circle {
                center,
                radius,
                layer: layer.into(),
            }))
        }

        pub fn add_polyline<I>(&mut self, vertices: I, is_closed: bool, layer: impl Into<String>) -> EntityId
        where
            I: IntoIterator<Item = Point2>,
        {
            self.add_entity(Entity::Polyline(Polyline {
                vertices: vertices.into_iter().map(PolylineVertex::new).collect(),
                is_closed,
                width: None,
                layer: layer.into(),
            }))
        }

        pub fn add_text(
            &mut self,
            insert: Point2,
            content: impl Into<String>,
            height: f64,
            rotation: f64,
            layer: impl Into<String>,
        ) -> EntityId {
            self.add_entity(Entity::Text(Text {
                insert,
                content: content.into(),
                height,
                rotation,
                layer: layer.into(),
            }))
        }

        pub fn add_block_definition(&mut self, definition: BlockDefinition) {
            for entity in &definition.entities {
                self.ensure_layer(entity.layer_name());
            }
            self.blocks.insert(definition.name.clone(), definition);
        }

        pub fn record_skipped(&mut self, kind: impl Into<String>) {
            *self.skipped.entry(kind.into()).or_insert(0) += 1;
        }

        #[inline]
        pub fn skipped(&self) -> &BTreeMap<String, usize> {
            &self.skipped
        }

        #[inline]
        pub fn layers(&self) -> impl Iterator<Item = &Layer> {
            self.layers.values()
        }

        #[inline]
        pub fn entities(&self) -> impl Iterator<Item = &(EntityId, Entity)> {
            self.entities.iter()
        }

        #[inline]
        pub fn entity_at(&self, slot: usize) -> Option<&(EntityId, Entity)> {
            self.entities.get(slot)
        }

        #[inline]
        pub fn entity_count(&self) -> usize {
            self.entities.len()
        }

        #[inline]
        pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
            self.blocks.get(name)
        }

        #[inline]
        pub fn blocks(&self) -> impl Iterator<Item = &BlockDefinition> {
            self.blocks.values()
        }

        pub fn entity(&self, id: EntityId) -> Option<&Entity> {
            self.entities
                .iter()
                .find_map(|(entity_id, entity)| (*entity_id == id).then_some(entity))
        }

        /// 计算实体范围，块参照会展开块定义（最多 `MAX_BLOCK_DEPTH` 层）。
        pub fn entity_bounds(&self, entity: &Entity) -> Option<Bounds2D> {
            self.entity_bounds_at_depth(entity, 0)
        }

        fn entity_bounds_at_depth(&self, entity: &Entity, depth: usize) -> Option<Bounds2D> {
            match entity {
                Entity::BlockReference(reference) => {
                    let mut bounds = entity.bounds().unwrap_or_else(Bounds2D::empty);
                    if let Some(block) = self.block_bounds(&reference.name, depth + 1) {
                        let transform = reference.transform()
                            * DAffine2::from_translation(-self.block_base(&reference.name));
                        bounds.include_bounds(&block.transformed(&transform));
                    }
                    if bounds.is_empty() { None } else { Some(bounds) }
                }
                Entity::Dimension(dimension) => {
                    let mut bounds = entity.bounds().unwrap_or_else(Bounds2D::empty);
                    if let Some(name) = dimension.block_name.as_deref() {
                        if let Some(block) = self.block_bounds(name, depth + 1) {
                            bounds.include_bounds(&block);
                        }
                    }
                    if bounds.is_empty() { None } else { Some(bounds) }
                }
                other => other.bounds(),
            }
        }

        fn block_base(&self, name: &str) -> DVec2 {
            self.blocks
                .get(name)
                .map(|block| block.base_point.as_vec2())
                .unwrap_or(DVec2::ZERO)
        }

        fn block_bounds(&self, name: &str, depth: usize) -> Option<Bounds2D> {
            if depth > MAX_BLOCK_DEPTH {
                return None;
            }
            let block = self.blocks.get(name)?;
            let mut bounds = Bounds2D::empty();
            for entity in &block.entities {
                if let Some(entity_bounds) = self.entity_bounds_at_depth(entity, depth) {
                    bounds.include_bounds(&entity_bounds);
                }
            }
            if bounds.is_empty() { None } else { Some(bounds) }
        }

        #[inline]
        fn next_id(&mut self) -> EntityId {
            let id = self.next_entity_id;
            self.next_entity_id += 1;
            EntityId(id)
        }
    }

    pub(crate) fn normalize_angle(angle: f64) -> f64 {
        let mut result = angle % TAU;
        if result < 0.0 {
            result += TAU;
        }
        result
    }

    /// 把起止角整理为 `start <= end <= start + TAU` 的区间，起止相同视为整圆。
    pub(crate) fn canonical_interval(start: f64, end: f64) -> (f64, f64) {
        let start = normalize_angle(start);
        let mut end = normalize_angle(end);
        if (end - start).abs() < 1e-9 {
            end = start + TAU;
        } else if end < start {
            end += TAU;
        }
        (start, end)
    }

    fn arc_point(center: Point2, radius: f64, angle: f64) -> Point2 {
        center.translate(Vector2::new(radius * angle.cos(), radius * angle.sin()))
    }

    fn arc_bounds(center: Point2, radius: f64, start_angle: f64, end_angle: f64, bounds: &mut Bounds2D) {
        let radius = radius.abs();
        if radius <= f64::EPSILON {
            bounds.include_point(center);
            return;
        }

        let (start, end) = canonical_interval(start_angle, end_angle);
        bounds.include_point(arc_point(center, radius, start));
        bounds.include_point(arc_point(center, radius, end));

        const QUADRANTS: [f64; 4] = [0.0, FRAC_PI_2, PI, FRAC_PI_2 * 3.0];
        for base in QUADRANTS {
            let mut candidate = base;
            while candidate < start {
                candidate += TAU;
            }
            if candidate <= end {
                bounds.include_point(arc_point(center, radius, candidate));
            }
        }
    }

    fn ellipse_bounds(ellipse: &Ellipse, bounds: &mut Bounds2D) {
        let major_vec = ellipse.major_axis.as_vec2();
        if major_vec.length() <= f64::EPSILON {
            bounds.include_point(ellipse.center);
            return;
        }
        let minor_vec = major_vec.perp() * ellipse.ratio.abs();
        let (start, end) = if (ellipse.end_parameter - ellipse.start_parameter).abs() < 1e-9 {
            (ellipse.start_parameter, ellipse.start_parameter + TAU)
        } else {
            let mut end = ellipse.end_parameter;
            while end < ellipse.start_parameter {
                end += TAU;
            }
            (ellipse.start_parameter, end)
        };
        let span = end - start;
        let step_count = ((span / (TAU / 64.0)).ceil() as usize).max(16);
        for i in 0..=step_count {
            let t = start + span * (i as f64 / step_count as f64);
            let offset = major_vec * t.cos() + minor_vec * t.sin();
            bounds.include_point(Point2::from_vec(ellipse.center.as_vec2() + offset));
        }
    }

    /// bulge 圆弧段的圆心、半径与起止角；直线段返回 None。
    pub(crate) fn bulge_arc(start: Point2, end: Point2, bulge: f64) -> Option<(Point2, f64, f64, f64)> {
        if bulge.abs() <= 1e-9 {
            return None;
        }
        let start_vec = start.as_vec2();
        let end_vec = end.as_vec2();
        let chord = end_vec - start_vec;
        let chord_len = chord.length();
        if chord_len <= f64::EPSILON {
            return None;
        }
        let theta = 4.0 * bulge.atan();
        let radius = chord_len / (2.0 * (theta / 2.0).sin());
        let midpoint = (start_vec + end_vec) * 0.5;
        let sagitta_offset = chord_len / 2.0 * (1.0 - bulge * bulge) / (2.0 * bulge);
        let center = midpoint + chord.perp().normalize() * sagitta_offset;
        let start_dir = start_vec - center;
        let start_angle = start_dir.y.atan2(start_dir.x);
        Some((Point2::from_vec(center), radius.abs(), start_angle, start_angle + theta))
    }

    fn bulge_bounds(start: Point2, end: Point2, bulge: f64, bounds: &mut Bounds2D) {
        if let Some((center, radius, a0, a1)) = bulge_arc(start, end, bulge) {
            let (from, to) = if a1 >= a0 { (a0, a1) } else { (a1, a0) };
            arc_bounds(center, radius, from, to, bounds);
        }
    }

}
