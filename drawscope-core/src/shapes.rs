//! 将实体离散为可绘制的图元（折线与文字框），坐标仍在图纸空间。

use std::f64::consts::TAU;

use glam::{DAffine2, DVec2};

use crate::document::{
    BlockReference, Document, Entity, MAX_BLOCK_DEPTH, Spline, TextFrame, bulge_arc,
    canonical_interval, estimate_text_frame,
};

/// 无文字高度时标注文本使用的默认字高（图纸单位）。
pub const DEFAULT_DIMENSION_TEXT_HEIGHT: f64 = 2.5;

const MAX_ARC_SEGMENTS: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    /// `width` 为图纸单位线宽，0 表示细线。
    Stroke {
        points: Vec<DVec2>,
        closed: bool,
        width: f64,
    },
    /// 文字：`corners` 依次为 左下、右下、右上、左上。
    Label {
        text: String,
        height: f64,
        rotation: f64,
        corners: [DVec2; 4],
    },
}

/// 以给定弦高容差离散实体。容差一般取“一个像素对应的图纸长度”的若干分之一。
pub struct Tessellator<'a> {
    document: &'a Document,
    tolerance: f64,
}

impl<'a> Tessellator<'a> {
    pub fn new(document: &'a Document, tolerance: f64) -> Self {
        let tolerance = if tolerance.is_finite() && tolerance > 0.0 {
            tolerance
        } else {
            1e-3
        };
        Self { document, tolerance }
    }

    pub fn tessellate(&self, entity: &Entity, out: &mut Vec<Primitive>) {
        self.emit(entity, &DAffine2::IDENTITY, 0, out);
    }

    fn emit(&self, entity: &Entity, transform: &DAffine2, depth: usize, out: &mut Vec<Primitive>) {
        let scale = transform.matrix2.determinant().abs().sqrt();
        let tolerance = if scale > f64::EPSILON {
            self.tolerance / scale
        } else {
            self.tolerance
        };
        match entity {
            Entity::Line(line) => {
                push_stroke(out, transform, vec![line.start.as_vec2(), line.end.as_vec2()], false, 0.0);
            }
            Entity::Circle(circle) => {
                let points = arc_points(circle.center.as_vec2(), circle.radius.abs(), 0.0, TAU, tolerance);
                push_stroke(out, transform, points, true, 0.0);
            }
            Entity::Arc(arc) => {
                let (start, end) = canonical_interval(arc.start_angle, arc.end_angle);
                let points = arc_points(arc.center.as_vec2(), arc.radius.abs(), start, end, tolerance);
                push_stroke(out, transform, points, false, 0.0);
            }
            Entity::Ellipse(ellipse) => {
                let major = ellipse.major_axis.as_vec2();
                let minor = major.perp() * ellipse.ratio.abs();
                let mut end = ellipse.end_parameter;
                if (end - ellipse.start_parameter).abs() < 1e-9 {
                    end = ellipse.start_parameter + TAU;
                }
                while end < ellipse.start_parameter {
                    end += TAU;
                }
                let span = end - ellipse.start_parameter;
                let count = segment_count(major.length(), span, tolerance);
                let center = ellipse.center.as_vec2();
                let points = (0..=count)
                    .map(|i| {
                        let t = ellipse.start_parameter + span * (i as f64 / count as f64);
                        center + major * t.cos() + minor * t.sin()
                    })
                    .collect();
                let closed = (span - TAU).abs() < 1e-9;
                push_stroke(out, transform, points, closed, 0.0);
            }
            Entity::Polyline(polyline) => {
                let vertices = &polyline.vertices;
                if vertices.is_empty() {
                    return;
                }
                let mut points = Vec::with_capacity(vertices.len());
                let segments = if polyline.is_closed {
                    vertices.len()
                } else {
                    vertices.len() - 1
                };
                points.push(vertices[0].position.as_vec2());
                for i in 0..segments {
                    let current = &vertices[i];
                    let next = &vertices[(i + 1) % vertices.len()];
                    match bulge_arc(current.position, next.position, current.bulge) {
                        Some((center, radius, a0, a1)) => {
                            let arc = arc_points(center.as_vec2(), radius, a0, a1, tolerance);
                            points.extend(arc.into_iter().skip(1));
                        }
                        None => points.push(next.position.as_vec2()),
                    }
                }
                if polyline.is_closed && points.len() > 1 {
                    points.pop();
                }
                let width = polyline.width.unwrap_or(0.0).max(0.0);
                push_stroke(out, transform, points, polyline.is_closed, width);
            }
            Entity::Spline(spline) => {
                if let Some(points) = spline_points(spline) {
                    push_stroke(out, transform, points, false, 0.0);
                }
            }
            Entity::Text(text) => {
                push_label(out, transform, text.content.clone(), &text.frame());
            }
            Entity::MText(mtext) => {
                push_label(out, transform, mtext.content.clone(), &mtext.frame());
            }
            Entity::BlockReference(reference) => {
                self.emit_block_reference(reference, transform, depth, out);
            }
            Entity::Dimension(dimension) => {
                let block = dimension
                    .block_name
                    .as_deref()
                    .and_then(|name| self.document.block(name))
                    .filter(|_| depth < MAX_BLOCK_DEPTH);
                match block {
                    Some(block) => {
                        for child in &block.entities {
                            self.emit(child, transform, depth + 1, out);
                        }
                    }
                    None => {
                        if let (Some(origin), Some(end)) =
                            (dimension.extension_line_origin, dimension.extension_line_end)
                        {
                            push_stroke(out, transform, vec![origin.as_vec2(), end.as_vec2()], false, 0.0);
                        }
                        if let Some(text) = dimension.display_text() {
                            let height = dimension.text_height.unwrap_or(DEFAULT_DIMENSION_TEXT_HEIGHT);
                            let frame = estimate_text_frame(
                                dimension.text_midpoint,
                                height,
                                dimension.text_rotation.unwrap_or(0.0),
                                &text,
                                1,
                                1,
                                None,
                            );
                            push_label(out, transform, text, &frame);
                        }
                    }
                }
            }
            Entity::Leader(leader) => {
                let points: Vec<DVec2> = leader.vertices.iter().map(|p| p.as_vec2()).collect();
                if leader.has_arrowhead && points.len() >= 2 {
                    let tip = points[0];
                    let direction = points[1] - tip;
                    let length = direction.length();
                    if length > f64::EPSILON {
                        let size = (length * 0.2).max(tolerance);
                        let axis = direction / length;
                        let base = tip + axis * size;
                        let side = axis.perp() * size * 0.3;
                        push_stroke(out, transform, vec![tip, base + side, base - side], true, 0.0);
                    }
                }
                push_stroke(out, transform, points, false, 0.0);
            }
        }
    }

    fn emit_block_reference(
        &self,
        reference: &BlockReference,
        transform: &DAffine2,
        depth: usize,
        out: &mut Vec<Primitive>,
    ) {
        for attribute in reference.attributes.iter().filter(|a| !a.is_invisible) {
            push_label(out, transform, attribute.text.clone(), &attribute.frame());
        }
        if depth >= MAX_BLOCK_DEPTH {
            return;
        }
        let Some(block) = self.document.block(&reference.name) else {
            return;
        };
        let local = *transform
            * reference.transform()
            * DAffine2::from_translation(-block.base_point.as_vec2());
        for child in &block.entities {
            self.emit(child, &local, depth + 1, out);
        }
    }
}

fn push_stroke(out: &mut Vec<Primitive>, transform: &DAffine2, points: Vec<DVec2>, closed: bool, width: f64) {
    if points.len() < 2 {
        return;
    }
    let scale = transform.matrix2.determinant().abs().sqrt();
    out.push(Primitive::Stroke {
        points: points.into_iter().map(|p| transform.transform_point2(p)).collect(),
        closed,
        width: width * scale,
    });
}

fn push_label(out: &mut Vec<Primitive>, transform: &DAffine2, text: String, frame: &TextFrame) {
    if text.trim().is_empty() || frame.height <= 0.0 {
        return;
    }
    let scale = transform.matrix2.determinant().abs().sqrt();
    let x_axis = transform.transform_vector2(DVec2::from_angle(frame.rotation));
    out.push(Primitive::Label {
        text,
        height: frame.height * scale,
        rotation: x_axis.y.atan2(x_axis.x),
        corners: frame.corners.map(|c| transform.transform_point2(c.as_vec2())),
    });
}

fn segment_count(radius: f64, span: f64, tolerance: f64) -> usize {
    let span = span.abs();
    if radius <= tolerance {
        return ((span / TAU * 8.0).ceil() as usize).max(1);
    }
    let step = 2.0 * (1.0 - tolerance / radius).acos();
    if !(step > 0.0) {
        return MAX_ARC_SEGMENTS;
    }
    let minimum = ((span / TAU * 8.0).ceil() as usize).max(1);
    ((span / step).ceil() as usize).clamp(minimum, MAX_ARC_SEGMENTS)
}

fn arc_points(center: DVec2, radius: f64, start: f64, end: f64, tolerance: f64) -> Vec<DVec2> {
    let span = end - start;
    let count = segment_count(radius, span, tolerance);
    (0..=count)
        .map(|i| {
            let angle = start + span * (i as f64 / count as f64);
            center + DVec2::new(angle.cos(), angle.sin()) * radius
        })
        .collect()
}

/// 样条离散：节点向量合法时用 de Boor 求值（支持权重），否则退回拟合点或控制多边形。
pub fn spline_points(spline: &Spline) -> Option<Vec<DVec2>> {
    if let Some(points) = evaluate_de_boor(spline) {
        return Some(points);
    }
    let fallback = if spline.fit_points.len() >= 2 {
        &spline.fit_points
    } else {
        &spline.control_points
    };
    if fallback.len() < 2 {
        return None;
    }
    Some(fallback.iter().map(|p| p.as_vec2()).collect())
}

fn evaluate_de_boor(spline: &Spline) -> Option<Vec<DVec2>> {
    let degree = usize::try_from(spline.degree).ok()?;
    let count = spline.control_points.len();
    let knots = &spline.knot_values;
    if degree == 0 || count < degree + 1 || knots.len() != count + degree + 1 {
        return None;
    }
    if knots.windows(2).any(|pair| pair[1] < pair[0]) {
        return None;
    }
    let start = knots[degree];
    let end = knots[count];
    if !(end > start) {
        return None;
    }

    let weights: Vec<f64> = if spline.weights.len() == count {
        spline.weights.clone()
    } else {
        vec![1.0; count]
    };
    if weights.iter().any(|w| *w <= 0.0) {
        return None;
    }
    let homogeneous: Vec<(DVec2, f64)> = spline
        .control_points
        .iter()
        .zip(&weights)
        .map(|(p, w)| (p.as_vec2() * *w, *w))
        .collect();

    let steps = (count * 12).clamp(16, 4096);
    let mut points = Vec::with_capacity(steps + 1);
    let mut scratch = vec![(DVec2::ZERO, 0.0); degree + 1];
    for i in 0..=steps {
        let u = start + (end - start) * (i as f64 / steps as f64);
        let mut span = degree;
        while span < count - 1 && knots[span + 1] <= u {
            span += 1;
        }
        for j in 0..=degree {
            scratch[j] = homogeneous[j + span - degree];
        }
        for r in 1..=degree {
            for j in (r..=degree).rev() {
                let left = knots[j + span - degree];
                let right = knots[j + 1 + span - r];
                let alpha = if right > left { (u - left) / (right - left) } else { 0.0 };
                let (prev_point, prev_weight) = scratch[j - 1];
                let (point, weight) = scratch[j];
                scratch[j] = (
                    prev_point * (1.0 - alpha) + point * alpha,
                    prev_weight * (1.0 - alpha) + weight * alpha,
                );
            }
        }
        let (point, weight) = scratch[degree];
        if weight.abs() <= f64::EPSILON {
            return None;
        }
        points.push(point / weight);
    }
    Some(points)
}
