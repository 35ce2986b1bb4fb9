//! Typed document objects: shapes, groups and their partial updates.
//!
//! Everything here is plain data. Values arriving from the network or from
//! disk go through [`Shape::sanitized`] / [`Group::sanitized`], which coerce
//! out-of-range numbers to safe defaults instead of failing, and through
//! `validate`, which rejects structurally unusable objects.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ModelError;

/// Maximum number of characters kept in a text shape's content.
pub const MAX_TEXT_LENGTH: usize = 10_000;
/// Smallest width/height a sanitized shape can have.
pub const MIN_DIMENSION: f64 = 1.0;
pub const DEFAULT_FILL: &str = "#ffffff";
pub const DEFAULT_STROKE: &str = "#000000";
pub const DEFAULT_STROKE_WIDTH: f64 = 1.0;
pub const DEFAULT_FONT_SIZE: f64 = 16.0;
/// Separates an object id from a field name in replicated map keys.
pub const ENTRY_SEPARATOR: char = '/';

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn sanitized(self) -> Self {
        Self {
            x: finite_or(self.x, 0.0),
            y: finite_or(self.y, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn sanitized(self) -> Self {
        Self {
            width: sanitize_dimension(self.width),
            height: sanitize_dimension(self.height),
        }
    }
}

/// Axis-aligned rectangle in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    fn sanitized(self) -> Self {
        Self {
            x: finite_or(self.x, 0.0),
            y: finite_or(self.y, 0.0),
            width: finite_or(self.width.abs(), 0.0),
            height: finite_or(self.height.abs(), 0.0),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Styling
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Style {
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    pub opacity: f64,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            fill: DEFAULT_FILL.to_string(),
            stroke: DEFAULT_STROKE.to_string(),
            stroke_width: DEFAULT_STROKE_WIDTH,
            opacity: 1.0,
        }
    }
}

impl Style {
    fn sanitized(self) -> Self {
        Self {
            fill: color_or(self.fill, DEFAULT_FILL),
            stroke: color_or(self.stroke, DEFAULT_STROKE),
            stroke_width: sanitize_stroke_width(self.stroke_width),
            opacity: sanitize_opacity(self.opacity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStyle {
    pub font_size: f64,
    pub font_family: String,
    pub font_weight: String,
    #[serde(default)]
    pub text_align: TextAlign,
    pub color: String,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_size: DEFAULT_FONT_SIZE,
            font_family: "sans-serif".to_string(),
            font_weight: "normal".to_string(),
            text_align: TextAlign::Left,
            color: DEFAULT_STROKE.to_string(),
        }
    }
}

impl TextStyle {
    fn sanitized(self) -> Self {
        let font_size = if self.font_size.is_finite() && self.font_size > 0.0 {
            self.font_size
        } else {
            DEFAULT_FONT_SIZE
        };
        Self {
            font_size,
            color: color_or(self.color, DEFAULT_STROKE),
            ..self
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Shapes
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rectangle,
    Circle,
    Text,
    Line,
}

impl ShapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Rectangle => "rectangle",
            ShapeKind::Circle => "circle",
            ShapeKind::Text => "text",
            ShapeKind::Line => "line",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rectangle" => Some(ShapeKind::Rectangle),
            "circle" => Some(ShapeKind::Circle),
            "text" => Some(ShapeKind::Text),
            "line" => Some(ShapeKind::Line),
            _ => None,
        }
    }
}

impl std::str::FromStr for ShapeKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShapeKind::parse(s).ok_or_else(|| ModelError::UnknownShapeType(s.to_string()))
    }
}

/// A drawable object on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shape {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    pub position: Point,
    pub dimensions: Size,
    #[serde(default)]
    pub style: Style,
    /// Only meaningful for [`ShapeKind::Text`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_style: Option<TextStyle>,
    /// Back-reference to the owning group, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl Shape {
    pub fn new(id: impl Into<String>, kind: ShapeKind, position: Point, dimensions: Size) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            dimensions,
            style: Style::default(),
            content: None,
            text_style: None,
            group_id: None,
        }
    }

    pub fn rectangle(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(id, ShapeKind::Rectangle, Point::new(x, y), Size::new(width, height))
    }

    pub fn circle(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(id, ShapeKind::Circle, Point::new(x, y), Size::new(width, height))
    }

    pub fn text(
        id: impl Into<String>,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        content: impl Into<String>,
    ) -> Self {
        let mut shape = Self::new(id, ShapeKind::Text, Point::new(x, y), Size::new(width, height));
        shape.content = Some(content.into());
        shape.text_style = Some(TextStyle::default());
        shape
    }

    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.style.fill = fill.into();
        self
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(
            self.position.x,
            self.position.y,
            self.dimensions.width,
            self.dimensions.height,
        )
    }

    /// Reject objects that cannot be stored at all.
    pub fn validate(&self) -> Result<(), ModelError> {
        validate_id(&self.id)?;
        if let Some(group_id) = &self.group_id {
            validate_id(group_id)?;
        }
        Ok(())
    }

    /// Coerce every field into its valid range.
    pub fn sanitized(self) -> Self {
        let content = match self.kind {
            ShapeKind::Text => self.content.map(truncate_content),
            _ => None,
        };
        Self {
            position: self.position.sanitized(),
            dimensions: self.dimensions.sanitized(),
            style: self.style.sanitized(),
            content,
            text_style: self.text_style.map(TextStyle::sanitized),
            group_id: self.group_id.filter(|g| !g.is_empty()),
            ..self
        }
    }
}

/// Partial update of a style; absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
}

impl StylePatch {
    pub fn is_empty(&self) -> bool {
        self.fill.is_none()
            && self.stroke.is_none()
            && self.stroke_width.is_none()
            && self.opacity.is_none()
    }
}

/// Partial update of a shape.
///
/// Optional shape fields use a nested `Option`: `None` leaves the field
/// alone, `Some(None)` clears it (serialized as JSON `null`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapePatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ShapeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StylePatch>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub content: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub text_style: Option<Option<TextStyle>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<String>>,
}

impl ShapePatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position: Some(Point::new(x, y)),
            ..Self::default()
        }
    }

    pub fn fill(fill: impl Into<String>) -> Self {
        Self {
            style: Some(StylePatch {
                fill: Some(fill.into()),
                ..StylePatch::default()
            }),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.position.is_none()
            && self.dimensions.is_none()
            && self.style.as_ref().map_or(true, StylePatch::is_empty)
            && self.content.is_none()
            && self.text_style.is_none()
            && self.group_id.is_none()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if let Some(Some(group_id)) = &self.group_id {
            validate_id(group_id)?;
        }
        Ok(())
    }

    /// Coerce the values carried by the patch; absent fields stay absent.
    pub fn sanitized(self) -> Self {
        Self {
            position: self.position.map(Point::sanitized),
            dimensions: self.dimensions.map(Size::sanitized),
            style: self.style.map(|s| StylePatch {
                fill: s.fill.map(|c| color_or(c, DEFAULT_FILL)),
                stroke: s.stroke.map(|c| color_or(c, DEFAULT_STROKE)),
                stroke_width: s.stroke_width.map(sanitize_stroke_width),
                opacity: s.opacity.map(sanitize_opacity),
            }),
            content: self.content.map(|c| c.map(truncate_content)),
            text_style: self.text_style.map(|t| t.map(TextStyle::sanitized)),
            group_id: self.group_id.map(|g| g.filter(|g| !g.is_empty())),
            ..self
        }
    }

    /// The shape that results from applying this patch to `shape`.
    pub fn apply_to(&self, shape: &Shape) -> Shape {
        let mut next = shape.clone();
        if let Some(kind) = self.kind {
            next.kind = kind;
        }
        if let Some(position) = self.position {
            next.position = position;
        }
        if let Some(dimensions) = self.dimensions {
            next.dimensions = dimensions;
        }
        if let Some(style) = &self.style {
            if let Some(fill) = &style.fill {
                next.style.fill = fill.clone();
            }
            if let Some(stroke) = &style.stroke {
                next.style.stroke = stroke.clone();
            }
            if let Some(width) = style.stroke_width {
                next.style.stroke_width = width;
            }
            if let Some(opacity) = style.opacity {
                next.style.opacity = opacity;
            }
        }
        if let Some(content) = &self.content {
            next.content = content.clone();
        }
        if let Some(text_style) = &self.text_style {
            next.text_style = text_style.clone();
        }
        if let Some(group_id) = &self.group_id {
            next.group_id = group_id.clone();
        }
        next.sanitized()
    }
}

// ───────────────────────────────────────────────────────────────────
// Groups
// ───────────────────────────────────────────────────────────────────

/// A set of shape references edited together.
///
/// Shapes are not owned: they stay independently addressable, and `bounds`
/// is a cached value that may lag behind concurrent edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub shape_ids: Vec<String>,
    #[serde(default)]
    pub bounds: Rect,
    #[serde(default)]
    pub locked: bool,
}

impl Group {
    pub fn new<I, S>(id: impl Into<String>, shape_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            shape_ids: shape_ids.into_iter().map(Into::into).collect(),
            bounds: Rect::default(),
            locked: false,
        }
    }

    pub fn contains(&self, shape_id: &str) -> bool {
        self.shape_ids.iter().any(|id| id == shape_id)
    }

    /// Union of the bounds of every member found in `shapes`.
    pub fn derive_bounds(&self, shapes: &[Shape]) -> Option<Rect> {
        shapes
            .iter()
            .filter(|s| self.contains(&s.id))
            .map(Shape::bounds)
            .reduce(|acc, r| acc.union(&r))
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        validate_id(&self.id)?;
        if self.shape_ids.is_empty() {
            return Err(ModelError::EmptyGroup(self.id.clone()));
        }
        self.shape_ids.iter().try_for_each(|id| validate_id(id))
    }

    pub fn sanitized(self) -> Self {
        Self {
            shape_ids: dedup_ids(self.shape_ids),
            bounds: self.bounds.sanitized(),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
}

impl GroupPatch {
    pub fn locked(locked: bool) -> Self {
        Self {
            locked: Some(locked),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shape_ids.is_none() && self.bounds.is_none() && self.locked.is_none()
    }

    pub fn validate(&self, group_id: &str) -> Result<(), ModelError> {
        if let Some(ids) = &self.shape_ids {
            if ids.is_empty() {
                return Err(ModelError::EmptyGroup(group_id.to_string()));
            }
            ids.iter().try_for_each(|id| validate_id(id))?;
        }
        Ok(())
    }

    pub fn sanitized(self) -> Self {
        Self {
            shape_ids: self.shape_ids.map(dedup_ids),
            bounds: self.bounds.map(Rect::sanitized),
            ..self
        }
    }

    pub fn apply_to(&self, group: &Group) -> Group {
        let mut next = group.clone();
        if let Some(ids) = &self.shape_ids {
            next.shape_ids = ids.clone();
        }
        if let Some(bounds) = self.bounds {
            next.bounds = bounds;
        }
        if let Some(locked) = self.locked {
            next.locked = locked;
        }
        next.sanitized()
    }
}

// ───────────────────────────────────────────────────────────────────
// Helpers
// ───────────────────────────────────────────────────────────────────

/// Ids are map key prefixes, so they must be non-empty and separator free.
pub fn validate_id(id: &str) -> Result<(), ModelError> {
    if id.is_empty() {
        return Err(ModelError::EmptyId);
    }
    if id.contains(ENTRY_SEPARATOR) {
        return Err(ModelError::ReservedSeparator(id.to_string()));
    }
    Ok(())
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn sanitize_dimension(value: f64) -> f64 {
    let magnitude = value.abs();
    if magnitude.is_finite() && magnitude > 0.0 {
        magnitude
    } else {
        MIN_DIMENSION
    }
}

fn sanitize_stroke_width(value: f64) -> f64 {
    if !value.is_finite() {
        DEFAULT_STROKE_WIDTH
    } else {
        value.max(0.0)
    }
}

fn sanitize_opacity(value: f64) -> f64 {
    if value.is_nan() {
        1.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn color_or(color: String, fallback: &str) -> String {
    if color.trim().is_empty() {
        fallback.to_string()
    } else {
        color
    }
}

fn truncate_content(content: String) -> String {
    if content.chars().count() > MAX_TEXT_LENGTH {
        content.chars().take(MAX_TEXT_LENGTH).collect()
    } else {
        content
    }
}

fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_json_is_camel_case() {
        let shape = Shape::rectangle("s1", 0.0, 0.0, 100.0, 100.0);
        let json = serde_json::to_value(&shape).unwrap();
        assert_eq!(json["type"], "rectangle");
        assert_eq!(json["style"]["strokeWidth"], 1.0);
        assert!(json.get("content").is_none());
        assert!(json.get("groupId").is_none());
    }

    #[test]
    fn test_shape_json_missing_style_uses_defaults() {
        let json = r#"{"id":"s1","type":"circle","position":{"x":1,"y":2},"dimensions":{"width":3,"height":4}}"#;
        let shape: Shape = serde_json::from_str(json).unwrap();
        assert_eq!(shape.kind, ShapeKind::Circle);
        assert_eq!(shape.style, Style::default());
    }

    #[test]
    fn test_sanitize_coerces_numbers() {
        let mut shape = Shape::rectangle("s1", f64::NAN, f64::INFINITY, -40.0, 0.0);
        shape.style.opacity = 3.0;
        shape.style.stroke_width = -2.0;
        let shape = shape.sanitized();

        assert_eq!(shape.position, Point::new(0.0, 0.0));
        assert_eq!(shape.dimensions, Size::new(40.0, MIN_DIMENSION));
        assert_eq!(shape.style.opacity, 1.0);
        assert_eq!(shape.style.stroke_width, 0.0);
    }

    #[test]
    fn test_sanitize_nan_style() {
        let style = Style {
            opacity: f64::NAN,
            stroke_width: f64::NAN,
            ..Style::default()
        };
        let shape = Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0)
            .with_style(style)
            .with_fill("  ")
            .sanitized();
        assert_eq!(shape.style.opacity, 1.0);
        assert_eq!(shape.style.stroke_width, DEFAULT_STROKE_WIDTH);
        assert_eq!(shape.style.fill, DEFAULT_FILL);
    }

    #[test]
    fn test_sanitize_content_only_on_text() {
        let mut rect = Shape::rectangle("r", 0.0, 0.0, 10.0, 10.0);
        rect.content = Some("hidden".to_string());
        assert!(rect.sanitized().content.is_none());

        let long = "x".repeat(MAX_TEXT_LENGTH + 50);
        let text = Shape::text("t", 0.0, 0.0, 10.0, 10.0, long).sanitized();
        assert_eq!(text.content.unwrap().chars().count(), MAX_TEXT_LENGTH);
    }

    #[test]
    fn test_validate_ids() {
        assert!(Shape::rectangle("ok", 0.0, 0.0, 1.0, 1.0).validate().is_ok());
        assert!(matches!(
            Shape::rectangle("", 0.0, 0.0, 1.0, 1.0).validate(),
            Err(ModelError::EmptyId)
        ));
        assert!(matches!(
            Shape::rectangle("a/b", 0.0, 0.0, 1.0, 1.0).validate(),
            Err(ModelError::ReservedSeparator(_))
        ));
    }

    #[test]
    fn test_patch_apply() {
        let shape = Shape::rectangle("s1", 0.0, 0.0, 100.0, 100.0);
        let patch = ShapePatch {
            position: Some(Point::new(5.0, 6.0)),
            style: Some(StylePatch {
                opacity: Some(0.5),
                ..StylePatch::default()
            }),
            ..ShapePatch::default()
        };
        let next = patch.apply_to(&shape);
        assert_eq!(next.position, Point::new(5.0, 6.0));
        assert_eq!(next.style.opacity, 0.5);
        assert_eq!(next.style.fill, DEFAULT_FILL);
        assert_eq!(next.dimensions, shape.dimensions);
    }

    #[test]
    fn test_patch_null_clears_optional_field() {
        let mut shape = Shape::rectangle("s1", 0.0, 0.0, 10.0, 10.0);
        shape.group_id = Some("g1".to_string());

        let patch: ShapePatch = serde_json::from_str(r#"{"groupId":null}"#).unwrap();
        assert_eq!(patch.group_id, Some(None));
        assert!(patch.apply_to(&shape).group_id.is_none());

        let untouched: ShapePatch = serde_json::from_str(r#"{"position":{"x":1,"y":1}}"#).unwrap();
        assert_eq!(untouched.group_id, None);
        assert_eq!(untouched.apply_to(&shape).group_id.as_deref(), Some("g1"));
    }

    #[test]
    fn test_patch_serializes_clear_as_null() {
        let patch = ShapePatch {
            content: Some(None),
            ..ShapePatch::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert!(json["content"].is_null());
        assert!(json.get("position").is_none());
    }

    #[test]
    fn test_group_validation() {
        assert!(Group::new("g1", ["a", "b"]).validate().is_ok());
        assert!(matches!(
            Group::new("g1", Vec::<String>::new()).validate(),
            Err(ModelError::EmptyGroup(_))
        ));
    }

    #[test]
    fn test_group_sanitize_dedups() {
        let group = Group::new("g1", ["a", "b", "a", "c", "b"]).sanitized();
        assert_eq!(group.shape_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_group_derive_bounds() {
        let shapes = vec![
            Shape::rectangle("a", 0.0, 0.0, 10.0, 10.0),
            Shape::rectangle("b", 20.0, 5.0, 10.0, 30.0),
            Shape::rectangle("outside", 500.0, 500.0, 1.0, 1.0),
        ];
        let group = Group::new("g", ["a", "b"]);
        assert_eq!(group.derive_bounds(&shapes), Some(Rect::new(0.0, 0.0, 30.0, 35.0)));
        assert_eq!(Group::new("g", ["zzz"]).derive_bounds(&shapes), None);
    }

    #[test]
    fn test_shape_kind_parse() {
        for kind in [ShapeKind::Rectangle, ShapeKind::Circle, ShapeKind::Text, ShapeKind::Line] {
            assert_eq!(ShapeKind::parse(kind.as_str()), Some(kind));
        }
        assert!("hexagon".parse::<ShapeKind>().is_err());
    }
}
