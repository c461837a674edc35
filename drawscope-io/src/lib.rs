use std::convert::TryFrom;
use std::fs;
use std::path::Path;

use drawscope_core::{
    document::{
        Arc, Attribute, BlockDefinition, BlockReference, Circle, Dimension, DimensionKind, Document,
        Ellipse, Entity, Leader, Line, MText, Polyline, PolylineVertex, Spline, Text,
    },
    geometry::{Point2, Vector2},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Document, IoError>;
}

/// ASCII DXF 读取器，仅处理 ENTITIES 与 BLOCKS 段。
#[derive(Debug, Default, Clone, Copy)]
pub struct DxfFacade;

impl DxfFacade {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, source: &str) -> Result<Document, IoError> {
        DxfParser::new(source).parse().map_err(|err| match err {
            DxfError::Unsupported { feature } => {
                IoError::InvalidDocument(format!("意外的不支持特性：{feature}"))
            }
            DxfError::Invalid { message } => IoError::InvalidDocument(message),
        })
    }
}

impl DocumentLoader for DxfFacade {
    fn load(&self, path: &Path) -> Result<Document, IoError> {
        let bytes = fs::read(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        // 旧版本图纸常见 GBK 等非 UTF-8 编码，无法解码的字节以替换字符保留。
        let data = String::from_utf8_lossy(&bytes);
        let document = self.parse_str(&data)?;
        debug!(
            path = %path.display(),
            entities = document.entity_count(),
            skipped = ?document.skipped(),
            "DXF 读取完成"
        );
        Ok(document)
    }
}

#[derive(Debug)]
enum DxfError {
    Unsupported { feature: String },
    Invalid { message: String },
}

impl DxfError {
    fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

struct DxfParser<'a> {
    reader: DxfReader<'a>,
}

impl<'a> DxfParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            reader: DxfReader::new(source),
        }
    }

    fn parse(mut self) -> Result<Document, DxfError> {
        let mut document = Document::new();
        while let Some((code, value)) = self.reader.next_pair()? {
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "意外的组码 {code}（期望 0 表示 SECTION/EOF）"
                )));
            }
            match value.trim() {
                "SECTION" => {
                    let (name_code, name) = self
                        .reader
                        .next_pair()?
                        .ok_or_else(|| DxfError::invalid("SECTION 缺少名称（组码 2）"))?;
                    if name_code != 2 {
                        return Err(DxfError::invalid(format!(
                            "SECTION 名称使用了组码 {name_code}（期望 2）"
                        )));
                    }
                    match name.trim() {
                        "ENTITIES" => self.parse_entities(&mut document)?,
                        "BLOCKS" => self.parse_blocks(&mut document)?,
                        _ => self.skip_section()?,
                    }
                }
                "EOF" => break,
                unexpected => {
                    return Err(DxfError::invalid(format!(
                        "意外的标记 {unexpected}，期望 SECTION 或 EOF"
                    )));
                }
            }
        }
        Ok(document)
    }

    fn skip_section(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some(_) => continue,
                None => {
                    return Err(DxfError::invalid("SECTION 未找到 ENDSEC 终止标记"));
                }
            }
        }
        Ok(())
    }

    fn parse_entities(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("ENTITIES 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "ENTITIES 段遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                "ENDSEC" => break,
                "SEQEND" => {
                    self.skip_entity_body()?;
                }
                kind => {
                    if let Some(entity) = self.parse_supported(kind, document)? {
                        document.add_entity(entity);
                    }
                }
            }
        }
        Ok(())
    }

    /// 解析一个实体；不支持的类型跳过并计数。
    fn parse_supported(
        &mut self,
        kind: &str,
        document: &mut Document,
    ) -> Result<Option<Entity>, DxfError> {
        match self.parse_entity(kind) {
            Ok(entity) => Ok(entity),
            Err(DxfError::Unsupported { feature }) => {
                debug!(kind, feature = %feature, "跳过暂不支持的实体");
                self.skip_entity_body()?;
                document.record_skipped(kind);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn parse_blocks(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => return Err(DxfError::invalid("BLOCKS 段提前结束")),
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "BLOCKS 段遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                "ENDSEC" => break,
                "BLOCK" => {
                    let definition = self.parse_block_definition(document)?;
                    document.add_block_definition(definition);
                }
                _ => {
                    // 未预期的条目，直接跳过
                    self.skip_entity_body()?;
                }
            }
        }
        Ok(())
    }

    /// 匿名块（`*D`、`*U` 等）同样保留，标注图形依赖它们。
    fn parse_block_definition(&mut self, document: &mut Document) -> Result<BlockDefinition, DxfError> {
        let mut name: Option<String> = None;
        let mut base_x: f64 = 0.0;
        let mut base_y: f64 = 0.0;
        let mut entities: Vec<Entity> = Vec::new();

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ENDBLK" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    "ATTDEF" | "SEQEND" => self.skip_entity_body()?,
                    entity_kind => {
                        if let Some(entity) = self.parse_supported(entity_kind, document)? {
                            entities.push(entity);
                        }
                    }
                },
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    10 => base_x = parse_f64(&value, "BLOCK 基点 X")?,
                    20 => base_y = parse_f64(&value, "BLOCK 基点 Y")?,
                    _ => {}
                },
                None => {
                    return Err(DxfError::invalid("BLOCK 定义未找到 ENDBLK 终止标记"));
                }
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("BLOCK 缺少名称（组码 2）"))?;
        Ok(BlockDefinition {
            name,
            base_point: Point2::new(base_x, base_y),
            entities,
        })
    }

    fn parse_entity(&mut self, kind: &str) -> Result<Option<Entity>, DxfError> {
        let entity = match kind {
            "LINE" => self.parse_line()?,
            "CIRCLE" => self.parse_circle()?,
            "ARC" => self.parse_arc()?,
            "ELLIPSE" => self.parse_ellipse()?,
            "LWPOLYLINE" => self.parse_lwpolyline()?,
            "POLYLINE" => return self.parse_polyline(),
            "SPLINE" => self.parse_spline()?,
            "TEXT" => self.parse_text()?,
            "MTEXT" => self.parse_mtext()?,
            "INSERT" => self.parse_insert()?,
            "DIMENSION" => self.parse_dimension()?,
            "LEADER" => self.parse_leader()?,
            other => return Err(DxfError::unsupported(format!("暂不支持的实体类型 {other}"))),
        };
        Ok(Some(entity))
    }

    fn parse_line(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut start_x = None;
        let mut start_y = None;
        let mut end_x = None;
        let mut end_y = None;
        while let Some((code, value)) = self.next_field("LINE")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut start_x, &value, "LINE 起点 X（组码 10）")?,
                20 => assign_coord(&mut start_y, &value, "LINE 起点 Y（组码 20）")?,
                11 => assign_coord(&mut end_x, &value, "LINE 终点 X（组码 11）")?,
                21 => assign_coord(&mut end_y, &value, "LINE 终点 Y（组码 21）")?,
                _ => {}
            }
        }

        let sx = start_x.ok_or_else(|| DxfError::invalid("LINE 缺少起点 X（组码 10）"))?;
        let sy = start_y.ok_or_else(|| DxfError::invalid("LINE 缺少起点 Y（组码 20）"))?;
        let ex = end_x.ok_or_else(|| DxfError::invalid("LINE 缺少终点 X（组码 11）"))?;
        let ey = end_y.ok_or_else(|| DxfError::invalid("LINE 缺少终点 Y（组码 21）"))?;

        Ok(Entity::Line(Line {
            start: Point2::new(sx, sy),
            end: Point2::new(ex, ey),
            layer: layer_or_default(layer),
        }))
    }

    fn parse_circle(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        while let Some((code, value)) = self.next_field("CIRCLE")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut center_x, &value, "CIRCLE 圆心 X（组码 10）")?,
                20 => assign_coord(&mut center_y, &value, "CIRCLE 圆心 Y（组码 20）")?,
                40 => assign_coord(&mut radius, &value, "CIRCLE 半径（组码 40）")?,
                _ => {}
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("CIRCLE 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("CIRCLE 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::invalid("CIRCLE 缺少半径（组码 40）"))?;

        Ok(Entity::Circle(Circle {
            center: Point2::new(cx, cy),
            radius,
            layer: layer_or_default(layer),
        }))
    }

    fn parse_arc(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        let mut start_angle = None;
        let mut end_angle = None;
        while let Some((code, value)) = self.next_field("ARC")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut center_x, &value, "ARC 圆心 X（组码 10）")?,
                20 => assign_coord(&mut center_y, &value, "ARC 圆心 Y（组码 20）")?,
                40 => assign_coord(&mut radius, &value, "ARC 半径（组码 40）")?,
                50 => assign_coord(&mut start_angle, &value, "ARC 起始角（组码 50）")?,
                51 => assign_coord(&mut end_angle, &value, "ARC 终止角（组码 51）")?,
                _ => {}
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("ARC 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("ARC 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::invalid("ARC 缺少半径（组码 40）"))?;
        let start_angle =
            start_angle.ok_or_else(|| DxfError::invalid("ARC 缺少起始角（组码 50）"))?;
        let end_angle = end_angle.ok_or_else(|| DxfError::invalid("ARC 缺少终止角（组码 51）"))?;

        Ok(Entity::Arc(Arc {
            center: Point2::new(cx, cy),
            radius,
            start_angle: start_angle.to_radians(),
            end_angle: end_angle.to_radians(),
            layer: layer_or_default(layer),
        }))
    }

    fn parse_ellipse(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut center_x = None;
        let mut center_y = None;
        let mut major_x = None;
        let mut major_y = None;
        let mut ratio = None;
        let mut start_parameter = 0.0;
        let mut end_parameter = std::f64::consts::TAU;

        while let Some((code, value)) = self.next_field("ELLIPSE")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut center_x, &value, "ELLIPSE 圆心 X（组码 10）")?,
                20 => assign_coord(&mut center_y, &value, "ELLIPSE 圆心 Y（组码 20）")?,
                11 => assign_coord(&mut major_x, &value, "ELLIPSE 主轴向量 X（组码 11）")?,
                21 => assign_coord(&mut major_y, &value, "ELLIPSE 主轴向量 Y（组码 21）")?,
                40 => assign_coord(&mut ratio, &value, "ELLIPSE 半径比（组码 40）")?,
                41 => start_parameter = parse_f64(&value, "ELLIPSE 起始参数")?,
                42 => end_parameter = parse_f64(&value, "ELLIPSE 终止参数")?,
                _ => {}
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少圆心 Y（组码 20）"))?;
        let major_x =
            major_x.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少主轴向量 X（组码 11）"))?;
        let major_y =
            major_y.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少主轴向量 Y（组码 21）"))?;

        if major_x.abs() < f64::EPSILON && major_y.abs() < f64::EPSILON {
            return Err(DxfError::invalid("ELLIPSE 主轴向量长度为 0，无法创建实体"));
        }

        let ratio = ratio.unwrap_or(1.0);
        if ratio <= 0.0 {
            return Err(DxfError::invalid(format!(
                "ELLIPSE 半径比必须为正数，实际为 {ratio}"
            )));
        }

        Ok(Entity::Ellipse(Ellipse {
            center: Point2::new(cx, cy),
            major_axis: Vector2::new(major_x, major_y),
            ratio,
            start_parameter,
            end_parameter,
            layer: layer_or_default(layer),
        }))
    }

    fn parse_lwpolyline(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut is_closed = false;
        let mut width: Option<f64> = None;
        let mut vertices: Vec<PolylineVertex> = Vec::new();
        let mut pending_x: Option<f64> = None;

        while let Some((code, value)) = self.next_field("LWPOLYLINE")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                70 => {
                    let flag = parse_i32(&value, "LWPOLYLINE 标志")?;
                    is_closed = flag & 0x01 == 0x01;
                }
                43 => width = Some(parse_f64(&value, "LWPOLYLINE 全局线宽（组码 43）")?),
                10 => {
                    if pending_x
                        .replace(parse_f64(&value, "LWPOLYLINE 顶点 X")?)
                        .is_some()
                    {
                        return Err(DxfError::invalid("LWPOLYLINE 顶点缺少对应的 Y（组码 20）"));
                    }
                }
                20 => {
                    let y = parse_f64(&value, "LWPOLYLINE 顶点 Y")?;
                    let x = pending_x.take().ok_or_else(|| {
                        DxfError::invalid("LWPOLYLINE 顶点缺少对应的 X（组码 10）")
                    })?;
                    vertices.push(PolylineVertex::new(Point2::new(x, y)));
                }
                42 => {
                    let bulge = parse_f64(&value, "LWPOLYLINE 顶点 bulge")?;
                    let vertex = vertices.last_mut().ok_or_else(|| {
                        DxfError::invalid("LWPOLYLINE 在定义首个顶点前遇到 bulge（组码 42）")
                    })?;
                    vertex.bulge = bulge;
                }
                _ => {}
            }
        }

        if pending_x.is_some() {
            return Err(DxfError::invalid(
                "LWPOLYLINE 顶点坐标成对出现（组码 10/20），检测到不完整的顶点",
            ));
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("LWPOLYLINE 未解析到任何顶点"));
        }

        Ok(Entity::Polyline(Polyline {
            vertices,
            is_closed,
            width: width.filter(|w| *w > 0.0),
            layer: layer_or_default(layer),
        }))
    }

    /// 旧式 POLYLINE：读取头部，随后的 VERTEX 记录直到 SEQEND。网格与多面体不参与渲染，按跳过处理。
    fn parse_polyline(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut layer = None;
        let mut flags: i16 = 0;
        let mut start_width: Option<f64> = None;
        let mut end_width: Option<f64> = None;
        while let Some((code, value)) = self.next_field("POLYLINE")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                70 => flags = parse_i16(&value, "POLYLINE 标志（组码 70）")?,
                40 => start_width = Some(parse_f64(&value, "POLYLINE 起始线宽（组码 40）")?),
                41 => end_width = Some(parse_f64(&value, "POLYLINE 终止线宽（组码 41）")?),
                _ => {}
            }
        }

        let mut vertices: Vec<PolylineVertex> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "VERTEX" => {
                        if let Some(vertex) = self.parse_vertex()? {
                            vertices.push(vertex);
                        }
                    }
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some(_) => continue,
                None => break,
            }
        }

        if flags & (0x10 | 0x40) != 0 {
            return Err(DxfError::unsupported("POLYLINE 网格/多面体"));
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("POLYLINE 未解析到任何顶点"));
        }

        let width = match (start_width, end_width) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        Ok(Some(Entity::Polyline(Polyline {
            vertices,
            is_closed: flags & 0x01 != 0,
            width: width.filter(|w| *w > 0.0),
            layer: layer_or_default(layer),
        })))
    }

    fn parse_vertex(&mut self) -> Result<Option<PolylineVertex>, DxfError> {
        let mut x = None;
        let mut y = None;
        let mut bulge = 0.0;
        let mut flags: i16 = 0;
        while let Some((code, value)) = self.next_field("VERTEX")? {
            match code {
                10 => assign_coord(&mut x, &value, "VERTEX X（组码 10）")?,
                20 => assign_coord(&mut y, &value, "VERTEX Y（组码 20）")?,
                42 => bulge = parse_f64(&value, "VERTEX bulge（组码 42）")?,
                70 => flags = parse_i16(&value, "VERTEX 标志（组码 70）")?,
                _ => {}
            }
        }
        // 样条拟合的控制顶点不属于可见折线。
        if flags & 0x10 != 0 {
            return Ok(None);
        }
        match (x, y) {
            (Some(x), Some(y)) => Ok(Some(PolylineVertex::with_bulge(Point2::new(x, y), bulge))),
            _ => Err(DxfError::invalid("VERTEX 缺少完整的 XY 坐标")),
        }
    }

    fn parse_spline(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut flags: i16 = 0;
        let mut degree: Option<i16> = None;
        let mut knot_values: Vec<f64> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        let mut control_points: Vec<Point2> = Vec::new();
        let mut fit_points: Vec<Point2> = Vec::new();
        let mut pending_control_x: Option<f64> = None;
        let mut pending_fit_x: Option<f64> = None;

        while let Some((code, value)) = self.next_field("SPLINE")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                70 => flags = parse_i16(&value, "SPLINE 类型标志（组码 70）")?,
                71 => degree = Some(parse_i16(&value, "SPLINE 阶数（组码 71）")?),
                40 => knot_values.push(parse_f64(&value, "SPLINE 节点值（组码 40）")?),
                41 => weights.push(parse_f64(&value, "SPLINE 权重（组码 41）")?),
                10 => {
                    if pending_control_x
                        .replace(parse_f64(&value, "SPLINE 控制点 X（组码 10）")?)
                        .is_some()
                    {
                        return Err(DxfError::invalid(
                            "SPLINE 控制点 X（组码 10）在未提供 Y 之前重复出现",
                        ));
                    }
                }
                20 => {
                    let y = parse_f64(&value, "SPLINE 控制点 Y（组码 20）")?;
                    let x = pending_control_x.take().ok_or_else(|| {
                        DxfError::invalid("SPLINE 控制点 Y（组码 20）缺少对应的 X")
                    })?;
                    control_points.push(Point2::new(x, y));
                }
                11 => {
                    if pending_fit_x
                        .replace(parse_f64(&value, "SPLINE 拟合点 X（组码 11）")?)
                        .is_some()
                    {
                        return Err(DxfError::invalid(
                            "SPLINE 拟合点 X（组码 11）在未提供 Y 之前重复出现",
                        ));
                    }
                }
                21 => {
                    let y = parse_f64(&value, "SPLINE 拟合点 Y（组码 21）")?;
                    let x = pending_fit_x.take().ok_or_else(|| {
                        DxfError::invalid("SPLINE 拟合点 Y（组码 21）缺少对应的 X")
                    })?;
                    fit_points.push(Point2::new(x, y));
                }
                _ => {}
            }
        }

        if let Some(x) = pending_control_x {
            return Err(DxfError::invalid(format!(
                "SPLINE 控制点 X={x} 缺少对应的 Y（组码 20）"
            )));
        }
        if let Some(x) = pending_fit_x {
            return Err(DxfError::invalid(format!(
                "SPLINE 拟合点 X={x} 缺少对应的 Y（组码 21）"
            )));
        }
        if control_points.is_empty() && fit_points.is_empty() {
            return Err(DxfError::invalid("SPLINE 既没有控制点也没有拟合点"));
        }

        let degree = degree.ok_or_else(|| DxfError::invalid("SPLINE 缺少阶数（组码 71）"))? as i32;
        Ok(Entity::Spline(Spline {
            degree,
            is_closed: flags & 0x01 != 0,
            control_points,
            fit_points,
            knot_values,
            weights,
            layer: layer_or_default(layer),
        }))
    }

    fn parse_text(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height = None;
        let mut rotation_deg = 0.0;
        let mut text: Option<String> = None;
        while let Some((code, value)) = self.next_field("TEXT")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut insert_x, &value, "TEXT 插入点 X（组码 10）")?,
                20 => assign_coord(&mut insert_y, &value, "TEXT 插入点 Y（组码 20）")?,
                40 => assign_coord(&mut height, &value, "TEXT 文字高度（组码 40）")?,
                50 => rotation_deg = parse_f64(&value, "TEXT 旋转角")?,
                1 => text = Some(decode_inline_text(&value)),
                _ => {}
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("TEXT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("TEXT 缺少插入点 Y（组码 20）"))?;
        let height = height.ok_or_else(|| DxfError::invalid("TEXT 缺少文字高度（组码 40）"))?;
        let content = text.ok_or_else(|| DxfError::invalid("TEXT 缺少文本内容（组码 1）"))?;

        Ok(Entity::Text(Text {
            insert: Point2::new(ix, iy),
            content,
            height,
            rotation: rotation_deg.to_radians(),
            layer: layer_or_default(layer),
        }))
    }

    fn parse_mtext(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height = None;
        let mut reference_width: Option<f64> = None;
        let mut direction_x: Option<f64> = None;
        let mut direction_y: Option<f64> = None;
        let mut rotation_deg: Option<f64> = None;
        let mut attachment_point: i16 = 1;
        let mut fragments: Vec<String> = Vec::new();

        while let Some((code, value)) = self.next_field("MTEXT")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut insert_x, &value, "MTEXT 插入点 X（组码 10）")?,
                20 => assign_coord(&mut insert_y, &value, "MTEXT 插入点 Y（组码 20）")?,
                40 => assign_coord(&mut height, &value, "MTEXT 文本高度（组码 40）")?,
                41 => {
                    let width = parse_f64(&value, "MTEXT 参考宽度")?;
                    reference_width = (width.abs() >= f64::EPSILON).then_some(width);
                }
                11 => direction_x = Some(parse_f64(&value, "MTEXT 方向向量 X")?),
                21 => direction_y = Some(parse_f64(&value, "MTEXT 方向向量 Y")?),
                50 => rotation_deg = Some(parse_f64(&value, "MTEXT 旋转角")?),
                71 => attachment_point = parse_i16(&value, "MTEXT 附着点 (组码 71)")?,
                // 组码 3 为前置分段，组码 1 为最后一段。
                1 | 3 => fragments.push(value),
                _ => {}
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("MTEXT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("MTEXT 缺少插入点 Y（组码 20）"))?;
        let height = height.ok_or_else(|| DxfError::invalid("MTEXT 缺少文本高度（组码 40）"))?;
        if fragments.is_empty() {
            return Err(DxfError::invalid("MTEXT 缺少内容（组码 1/3）"));
        }

        let direction = match (direction_x, direction_y) {
            (Some(x), Some(y)) if x.abs() >= f64::EPSILON || y.abs() >= f64::EPSILON => {
                Vector2::new(x, y)
            }
            _ => match rotation_deg {
                Some(rot) => {
                    let rad = rot.to_radians();
                    Vector2::new(rad.cos(), rad.sin())
                }
                None => Vector2::new(1.0, 0.0),
            },
        };

        Ok(Entity::MText(MText {
            insert: Point2::new(ix, iy),
            content: decode_mtext_content(&fragments.concat()),
            height,
            reference_width,
            direction,
            attachment_point,
            layer: layer_or_default(layer),
        }))
    }

    fn parse_insert(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut name = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut scale_x: Option<f64> = None;
        let mut scale_y: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;

        while let Some((code, value)) = self.next_field("INSERT")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                2 => {
                    if name.is_some() {
                        return Err(DxfError::invalid("INSERT 遇到重复的块名（组码 2）"));
                    }
                    name = Some(value.trim().to_string());
                }
                10 => assign_coord(&mut insert_x, &value, "INSERT 插入点 X（组码 10）")?,
                20 => assign_coord(&mut insert_y, &value, "INSERT 插入点 Y（组码 20）")?,
                41 => scale_x = Some(parse_f64(&value, "INSERT 缩放 X")?),
                42 => scale_y = Some(parse_f64(&value, "INSERT 缩放 Y")?),
                50 => rotation_deg = parse_f64(&value, "INSERT 旋转角")?,
                _ => {}
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("INSERT 缺少块名（组码 2）"))?;
        let ix = insert_x.ok_or_else(|| DxfError::invalid("INSERT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("INSERT 缺少插入点 Y（组码 20）"))?;
        let sx = scale_x.unwrap_or(1.0);
        let sy = scale_y.unwrap_or(sx);

        let mut attributes: Vec<Attribute> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ATTRIB" => attributes.push(self.parse_attrib()?),
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some((code, value)) => {
                    return Err(DxfError::invalid(format!(
                        "INSERT 属性段出现意外组码 {code} 值 {value}"
                    )));
                }
                None => break,
            }
        }

        Ok(Entity::BlockReference(BlockReference {
            name,
            insert: Point2::new(ix, iy),
            scale: Vector2::new(sx, sy),
            rotation: rotation_deg.to_radians(),
            attributes,
            layer: layer_or_default(layer),
        }))
    }

    fn parse_attrib(&mut self) -> Result<Attribute, DxfError> {
        let mut layer = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;
        let mut text: Option<String> = None;
        let mut tag: Option<String> = None;
        let mut flags: i16 = 0;

        while let Some((code, value)) = self.next_field("ATTRIB")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => assign_coord(&mut insert_x, &value, "ATTRIB 插入点 X（组码 10）")?,
                20 => assign_coord(&mut insert_y, &value, "ATTRIB 插入点 Y（组码 20）")?,
                40 => height = Some(parse_f64(&value, "ATTRIB 高度")?),
                50 => rotation_deg = parse_f64(&value, "ATTRIB 旋转角")?,
                1 => text = Some(value),
                2 => tag = Some(value.trim().to_string()),
                70 => flags = parse_i16(&value, "ATTRIB 标志")?,
                _ => {}
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("ATTRIB 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("ATTRIB 缺少插入点 Y（组码 20）"))?;
        let text = text.ok_or_else(|| DxfError::invalid("ATTRIB 缺少文本内容（组码 1）"))?;
        let tag = tag.ok_or_else(|| DxfError::invalid("ATTRIB 缺少标记（组码 2）"))?;

        Ok(Attribute {
            tag,
            text: decode_inline_text(&text),
            insert: Point2::new(ix, iy),
            height: height.unwrap_or(0.0),
            rotation: rotation_deg.to_radians(),
            is_invisible: flags & 0x01 != 0,
            layer: layer_or_default(layer),
        })
    }

    fn parse_dimension(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut block_name: Option<String> = None;
        let mut flags: i16 = 0;
        let mut definition_x = None;
        let mut definition_y = None;
        let mut text_mid_x = None;
        let mut text_mid_y = None;
        let mut ext_origin_x = None;
        let mut ext_origin_y = None;
        let mut ext_end_x = None;
        let mut ext_end_y = None;
        let mut text_override: Option<String> = None;
        let mut measurement: Option<f64> = None;
        let mut text_rotation_deg: Option<f64> = None;

        while let Some((code, value)) = self.next_field("DIMENSION")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                2 => {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        block_name = Some(trimmed.to_string());
                    }
                }
                70 => flags = parse_i16(&value, "DIMENSION 类型标志（组码 70）")?,
                1 => {
                    let entry = value.trim().to_string();
                    text_override = (!entry.is_empty() && entry != "<>").then_some(entry);
                }
                10 => definition_x = Some(parse_f64(&value, "DIMENSION 定义点 X（组码 10）")?),
                20 => definition_y = Some(parse_f64(&value, "DIMENSION 定义点 Y（组码 20）")?),
                11 => text_mid_x = Some(parse_f64(&value, "DIMENSION 文本位置 X（组码 11）")?),
                21 => text_mid_y = Some(parse_f64(&value, "DIMENSION 文本位置 Y（组码 21）")?),
                13 => ext_origin_x = Some(parse_f64(&value, "DIMENSION 引线起点 X（组码 13）")?),
                23 => ext_origin_y = Some(parse_f64(&value, "DIMENSION 引线起点 Y（组码 23）")?),
                14 => ext_end_x = Some(parse_f64(&value, "DIMENSION 引线终点 X（组码 14）")?),
                24 => ext_end_y = Some(parse_f64(&value, "DIMENSION 引线终点 Y（组码 24）")?),
                42 => measurement = Some(parse_f64(&value, "DIMENSION 测量值（组码 42）")?),
                53 => {
                    text_rotation_deg = Some(parse_f64(&value, "DIMENSION 文本旋转（组码 53）")?)
                }
                _ => {}
            }
        }

        let dx =
            definition_x.ok_or_else(|| DxfError::invalid("DIMENSION 缺少定义点 X（组码 10）"))?;
        let dy =
            definition_y.ok_or_else(|| DxfError::invalid("DIMENSION 缺少定义点 Y（组码 20）"))?;
        let (tx, ty) = match (text_mid_x, text_mid_y) {
            (Some(x), Some(y)) => (x, y),
            _ => (dx, dy),
        };

        let extension_line_origin = match (ext_origin_x, ext_origin_y) {
            (Some(x), Some(y)) => Some(Point2::new(x, y)),
            _ => None,
        };
        let extension_line_end = match (ext_end_x, ext_end_y) {
            (Some(x), Some(y)) => Some(Point2::new(x, y)),
            _ => None,
        };

        Ok(Entity::Dimension(Dimension {
            kind: DimensionKind::from_flags(flags),
            block_name,
            definition_point: Point2::new(dx, dy),
            text_midpoint: Point2::new(tx, ty),
            extension_line_origin,
            extension_line_end,
            text: text_override,
            measurement,
            text_height: None,
            text_rotation: text_rotation_deg.map(f64::to_radians),
            layer: layer_or_default(layer),
        }))
    }

    fn parse_leader(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut has_arrowhead = false;
        let mut pending_x: Option<f64> = None;
        let mut vertices: Vec<Point2> = Vec::new();

        while let Some((code, value)) = self.next_field("LEADER")? {
            match code {
                8 => layer = Some(value.trim().to_string()),
                10 => {
                    if pending_x.is_some() {
                        return Err(DxfError::invalid(
                            "LEADER 顶点 X（组码 10）重复出现且缺少对应的组码 20",
                        ));
                    }
                    pending_x = Some(parse_f64(&value, "LEADER 顶点 X（组码 10）")?);
                }
                20 => {
                    let x = pending_x.take().ok_or_else(|| {
                        DxfError::invalid("LEADER 顶点 Y（组码 20）出现前缺少组码 10")
                    })?;
                    let y = parse_f64(&value, "LEADER 顶点 Y（组码 20）")?;
                    vertices.push(Point2::new(x, y));
                }
                71 => {
                    has_arrowhead = parse_i16(&value, "LEADER 箭头标志（组码 71）")? & 0x01 != 0;
                }
                _ => {}
            }
        }

        if pending_x.is_some() {
            return Err(DxfError::invalid("LEADER 读取完毕时缺少最后一个顶点的组码 20"));
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("LEADER 缺少任意顶点（组码 10/20）"));
        }

        Ok(Entity::Leader(Leader {
            vertices,
            has_arrowhead,
            layer: layer_or_default(layer),
        }))
    }

    /// 读取当前实体的下一个字段；遇到组码 0 时回退并返回 None。
    fn next_field(&mut self, kind: &str) -> Result<Option<(i32, String)>, DxfError> {
        match self.reader.next_pair()? {
            Some((0, value)) => {
                self.reader.put_back((0, value));
                Ok(None)
            }
            Some(pair) => Ok(Some(pair)),
            None => Err(DxfError::invalid(format!("{kind} 未正确结束"))),
        }
    }

    fn skip_entity_body(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }
}

struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(i32, String)>,
    line_number: usize,
}

impl<'a> DxfReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines(),
            buffer: None,
            line_number: 0,
        }
    }

    fn next_pair(&mut self) -> Result<Option<(i32, String)>, DxfError> {
        if let Some(pair) = self.buffer.take() {
            return Ok(Some(pair));
        }

        let code_line = loop {
            match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Ok(None),
            }
        };

        let value_line = match self.lines.next() {
            Some(line) => {
                self.line_number += 1;
                line
            }
            None => {
                return Err(DxfError::invalid(format!(
                    "文件在第 {} 行结束，缺少与组码对应的值行",
                    self.line_number
                )));
            }
        };

        let code = code_line.trim().parse::<i32>().map_err(|_| {
            DxfError::invalid(format!(
                "第 {} 行的组码 \"{}\" 无法解析为整数",
                self.line_number - 1,
                code_line.trim()
            ))
        })?;
        let value = value_line.trim_end_matches('\r').to_string();
        Ok(Some((code, value)))
    }

    /// 只保留一个回退槽位；重复回退时后者覆盖前者。
    fn put_back(&mut self, pair: (i32, String)) {
        debug_assert!(self.buffer.is_none(), "内部错误：尝试多次回退 DXF pair");
        self.buffer = Some(pair);
    }
}

fn layer_or_default(layer: Option<String>) -> String {
    match layer {
        Some(name) if !name.is_empty() => name,
        _ => "0".to_string(),
    }
}

fn assign_coord(slot: &mut Option<f64>, raw: &str, context: &str) -> Result<(), DxfError> {
    if slot.is_some() {
        return Err(DxfError::invalid(format!("{context} 出现重复值")));
    }
    *slot = Some(parse_f64(raw, context)?);
    Ok(())
}

fn parse_f64(raw: &str, context: &str) -> Result<f64, DxfError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DxfError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i16(raw: &str, context: &str) -> Result<i16, DxfError> {
    let value = parse_i32(raw, context)?;
    i16::try_from(value)
        .map_err(|_| DxfError::invalid(format!("{context} 超出 i16 范围（值：{value}）")))
}

/// 去除 MTEXT 内联格式码，只保留可显示文本；`\P` 转为换行。
fn decode_mtext_content(raw: &str) -> String {
    let mut result = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('P') | Some('p') | Some('X') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('{') => result.push('{'),
                Some('}') => result.push('}'),
                Some('S') => {
                    // 堆叠分数 `\S1^2;` 显示为 `1/2`。
                    for next in chars.by_ref() {
                        match next {
                            ';' => break,
                            '^' | '#' => result.push('/'),
                            other => result.push(other),
                        }
                    }
                }
                Some('f') | Some('F') | Some('H') | Some('W') | Some('Q') | Some('T')
                | Some('A') | Some('C') | Some('c') => {
                    for next in chars.by_ref() {
                        if next == ';' {
                            break;
                        }
                    }
                }
                Some('L') | Some('l') | Some('O') | Some('o') | Some('K') | Some('k') => {}
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            },
            '{' | '}' => {}
            _ => result.push(ch),
        }
    }
    decode_special_codes(&result)
}

fn decode_inline_text(raw: &str) -> String {
    decode_special_codes(raw)
}

/// `%%c` 直径、`%%d` 度、`%%p` 正负号。
fn decode_special_codes(raw: &str) -> String {
    if !raw.contains("%%") {
        return raw.to_string();
    }
    let mut result = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find("%%") {
        result.push_str(&rest[..pos]);
        let tail = &rest[pos + 2..];
        let mut chars = tail.chars();
        match chars.next() {
            Some('c') | Some('C') => result.push('Ø'),
            Some('d') | Some('D') => result.push('°'),
            Some('p') | Some('P') => result.push('±'),
            Some('%') => result.push('%'),
            Some(other) => {
                result.push_str("%%");
                result.push(other);
            }
            None => {
                result.push_str("%%");
                rest = "";
                break;
            }
        }
        rest = chars.as_str();
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtext_formatting_codes_are_stripped() {
        let decoded = decode_mtext_content("{\\fSimSun|b0;\\H2.5;首层}\\P平面图");
        assert_eq!(decoded, "首层\n平面图");
    }

    #[test]
    fn stacked_fraction_is_flattened() {
        assert_eq!(decode_mtext_content("\\S1^2;"), "1/2");
    }

    #[test]
    fn special_codes_are_replaced() {
        assert_eq!(decode_inline_text("%%c600"), "Ø600");
        assert_eq!(decode_inline_text("90%%d"), "90°");
        assert_eq!(decode_inline_text("plain"), "plain");
    }

    #[test]
    fn unknown_entity_is_counted_not_fatal() {
        let source = "0\nSECTION\n2\nENTITIES\n0\nHATCH\n8\nFILL\n0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n5\n21\n0\n0\nENDSEC\n0\nEOF\n";
        let doc = DxfFacade::new().parse_str(source).expect("应当读取成功");
        assert_eq!(doc.entity_count(), 1);
        assert_eq!(doc.skipped().get("HATCH"), Some(&1));
    }

    #[test]
    fn missing_coordinate_is_reported() {
        let source = "0\nSECTION\n2\nENTITIES\n0\nLINE\n8\nWALL\n10\n0\n0\nENDSEC\n0\nEOF\n";
        let err = DxfFacade::new().parse_str(source).unwrap_err();
        assert!(matches!(err, IoError::InvalidDocument(message) if message.contains("LINE")));
    }
}
