//! Flat per-field layout of shapes and groups inside a replicated map.
//!
//! Every object is spread over one map entry per field, keyed
//! `"{id}/{field}"`. Concurrent writes to different fields of the same
//! object touch different entries and never conflict; writes to the same
//! field resolve by the map's last-writer-wins rule.
//!
//! ```text
//! shapes ─┬─ "s1/type"   → "rectangle"
//!         ├─ "s1/x"      → 0.0
//!         ├─ "s1/fill"   → "#00ff00"
//!         └─ ...
//! ```
//!
//! An object without a readable `type` (shapes) or `shapeIds` (groups) entry
//! is treated as absent, so removing the structural entries removes the
//! object even if stray field writes from other peers survive.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use yrs::{Any, Map, MapRef, Out, ReadTxn, TransactionMut};

use crate::model::{
    Group, GroupPatch, Point, Rect, Shape, ShapeKind, ShapePatch, Size, Style, TextStyle,
    DEFAULT_STROKE_WIDTH, ENTRY_SEPARATOR, MIN_DIMENSION,
};

/// Root map holding shape entries.
pub const SHAPES_MAP: &str = "shapes";
/// Root map holding group entries.
pub const GROUPS_MAP: &str = "groups";

/// Field names used as key suffixes.
pub mod field {
    pub const TYPE: &str = "type";
    pub const X: &str = "x";
    pub const Y: &str = "y";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const FILL: &str = "fill";
    pub const STROKE: &str = "stroke";
    pub const STROKE_WIDTH: &str = "strokeWidth";
    pub const OPACITY: &str = "opacity";
    pub const CONTENT: &str = "content";
    pub const TEXT_STYLE: &str = "textStyle";
    pub const GROUP_ID: &str = "groupId";
    pub const SHAPE_IDS: &str = "shapeIds";
    pub const LOCKED: &str = "locked";
}

const SHAPE_FIELDS: [&str; 12] = [
    field::TYPE,
    field::X,
    field::Y,
    field::WIDTH,
    field::HEIGHT,
    field::FILL,
    field::STROKE,
    field::STROKE_WIDTH,
    field::OPACITY,
    field::CONTENT,
    field::TEXT_STYLE,
    field::GROUP_ID,
];

const OPTIONAL_SHAPE_FIELDS: [&str; 3] = [field::CONTENT, field::TEXT_STYLE, field::GROUP_ID];

const GROUP_FIELDS: [&str; 6] = [
    field::SHAPE_IDS,
    field::X,
    field::Y,
    field::WIDTH,
    field::HEIGHT,
    field::LOCKED,
];

type Entries = Vec<(&'static str, Any)>;

pub fn entry_key(id: &str, field: &str) -> String {
    format!("{id}{ENTRY_SEPARATOR}{field}")
}

/// Split a map key into `(id, field)`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once(ENTRY_SEPARATOR)
}

// ───────────────────────────────────────────────────────────────────
// Encoding
// ───────────────────────────────────────────────────────────────────

fn text(value: &str) -> Any {
    Any::String(Arc::from(value))
}

fn encode_text_style(style: &TextStyle) -> Option<Any> {
    match serde_json::to_string(style) {
        Ok(json) => Some(text(&json)),
        Err(e) => {
            log::warn!("Dropping unencodable text style: {e}");
            None
        }
    }
}

/// All entries describing `shape`.
pub fn shape_entries(shape: &Shape) -> Entries {
    let mut entries = vec![
        (field::TYPE, text(shape.kind.as_str())),
        (field::X, Any::Number(shape.position.x)),
        (field::Y, Any::Number(shape.position.y)),
        (field::WIDTH, Any::Number(shape.dimensions.width)),
        (field::HEIGHT, Any::Number(shape.dimensions.height)),
        (field::FILL, text(&shape.style.fill)),
        (field::STROKE, text(&shape.style.stroke)),
        (field::STROKE_WIDTH, Any::Number(shape.style.stroke_width)),
        (field::OPACITY, Any::Number(shape.style.opacity)),
    ];
    if let Some(content) = &shape.content {
        entries.push((field::CONTENT, text(content)));
    }
    if let Some(encoded) = shape.text_style.as_ref().and_then(encode_text_style) {
        entries.push((field::TEXT_STYLE, encoded));
    }
    if let Some(group_id) = &shape.group_id {
        entries.push((field::GROUP_ID, text(group_id)));
    }
    entries
}

/// Entries touched by `patch`: values to write and fields to clear.
pub fn shape_patch_entries(patch: &ShapePatch) -> (Entries, Vec<&'static str>) {
    let mut set = Entries::new();
    let mut clear = Vec::new();

    if let Some(kind) = patch.kind {
        set.push((field::TYPE, text(kind.as_str())));
    }
    if let Some(position) = patch.position {
        set.push((field::X, Any::Number(position.x)));
        set.push((field::Y, Any::Number(position.y)));
    }
    if let Some(dimensions) = patch.dimensions {
        set.push((field::WIDTH, Any::Number(dimensions.width)));
        set.push((field::HEIGHT, Any::Number(dimensions.height)));
    }
    if let Some(style) = &patch.style {
        if let Some(fill) = &style.fill {
            set.push((field::FILL, text(fill)));
        }
        if let Some(stroke) = &style.stroke {
            set.push((field::STROKE, text(stroke)));
        }
        if let Some(width) = style.stroke_width {
            set.push((field::STROKE_WIDTH, Any::Number(width)));
        }
        if let Some(opacity) = style.opacity {
            set.push((field::OPACITY, Any::Number(opacity)));
        }
    }
    match &patch.content {
        Some(Some(content)) => set.push((field::CONTENT, text(content))),
        Some(None) => clear.push(field::CONTENT),
        None => {}
    }
    match &patch.text_style {
        Some(Some(style)) => {
            if let Some(encoded) = encode_text_style(style) {
                set.push((field::TEXT_STYLE, encoded));
            }
        }
        Some(None) => clear.push(field::TEXT_STYLE),
        None => {}
    }
    match &patch.group_id {
        Some(Some(group_id)) => set.push((field::GROUP_ID, text(group_id))),
        Some(None) => clear.push(field::GROUP_ID),
        None => {}
    }
    (set, clear)
}

pub fn group_entries(group: &Group) -> Entries {
    vec![
        (field::SHAPE_IDS, id_list(&group.shape_ids)),
        (field::X, Any::Number(group.bounds.x)),
        (field::Y, Any::Number(group.bounds.y)),
        (field::WIDTH, Any::Number(group.bounds.width)),
        (field::HEIGHT, Any::Number(group.bounds.height)),
        (field::LOCKED, Any::Bool(group.locked)),
    ]
}

pub fn group_patch_entries(patch: &GroupPatch) -> Entries {
    let mut set = Entries::new();
    if let Some(ids) = &patch.shape_ids {
        set.push((field::SHAPE_IDS, id_list(ids)));
    }
    if let Some(bounds) = patch.bounds {
        set.push((field::X, Any::Number(bounds.x)));
        set.push((field::Y, Any::Number(bounds.y)));
        set.push((field::WIDTH, Any::Number(bounds.width)));
        set.push((field::HEIGHT, Any::Number(bounds.height)));
    }
    if let Some(locked) = patch.locked {
        set.push((field::LOCKED, Any::Bool(locked)));
    }
    set
}

fn id_list(ids: &[String]) -> Any {
    let items: Vec<Any> = ids.iter().map(|id| text(id)).collect();
    Any::Array(items.into())
}

// ───────────────────────────────────────────────────────────────────
// Writing
// ───────────────────────────────────────────────────────────────────

fn write_entries(map: &MapRef, txn: &mut TransactionMut, id: &str, entries: Entries) {
    for (name, value) in entries {
        map.insert(txn, entry_key(id, name), value);
    }
}

fn clear_entries(map: &MapRef, txn: &mut TransactionMut, id: &str, names: &[&str]) {
    for name in names {
        map.remove(txn, &entry_key(id, name));
    }
}

/// Write every field of `shape`, clearing optional fields it does not carry.
pub fn write_shape(map: &MapRef, txn: &mut TransactionMut, shape: &Shape) {
    let entries = shape_entries(shape);
    let absent: Vec<&str> = OPTIONAL_SHAPE_FIELDS
        .into_iter()
        .filter(|name| !entries.iter().any(|(f, _)| f == name))
        .collect();
    clear_entries(map, txn, &shape.id, &absent);
    write_entries(map, txn, &shape.id, entries);
}

/// Write only the fields carried by `patch`.
pub fn write_shape_patch(map: &MapRef, txn: &mut TransactionMut, id: &str, patch: &ShapePatch) {
    let (set, clear) = shape_patch_entries(patch);
    clear_entries(map, txn, id, &clear);
    write_entries(map, txn, id, set);
}

pub fn write_group(map: &MapRef, txn: &mut TransactionMut, group: &Group) {
    write_entries(map, txn, &group.id, group_entries(group));
}

pub fn write_group_patch(map: &MapRef, txn: &mut TransactionMut, id: &str, patch: &GroupPatch) {
    write_entries(map, txn, id, group_patch_entries(patch));
}

/// Set or clear the `groupId` back-reference of a shape.
pub fn write_group_ref(map: &MapRef, txn: &mut TransactionMut, shape_id: &str, group_id: Option<&str>) {
    let key = entry_key(shape_id, field::GROUP_ID);
    match group_id {
        Some(group_id) => {
            map.insert(txn, key, text(group_id));
        }
        None => {
            map.remove(txn, &key);
        }
    }
}

/// Remove every entry belonging to `id`. Returns the number of entries removed.
pub fn remove_entity(map: &MapRef, txn: &mut TransactionMut, id: &str) -> usize {
    let keys: Vec<String> = map
        .keys(&*txn)
        .filter(|key| split_key(key).map_or(false, |(owner, _)| owner == id))
        .map(str::to_string)
        .collect();
    keys.iter()
        .filter(|key| map.remove(txn, key.as_str()).is_some())
        .count()
}

// ───────────────────────────────────────────────────────────────────
// Reading
// ───────────────────────────────────────────────────────────────────

fn as_f64(value: &Any) -> Option<f64> {
    match value {
        Any::Number(n) => Some(*n),
        Any::BigInt(n) => Some(*n as f64),
        _ => None,
    }
}

fn as_str(value: &Any) -> Option<&str> {
    match value {
        Any::String(s) => Some(&**s),
        _ => None,
    }
}

fn as_bool(value: &Any) -> Option<bool> {
    match value {
        Any::Bool(b) => Some(*b),
        _ => None,
    }
}

fn collect_objects<T: ReadTxn>(map: &MapRef, txn: &T) -> BTreeMap<String, HashMap<String, Any>> {
    let mut objects: BTreeMap<String, HashMap<String, Any>> = BTreeMap::new();
    for (key, value) in map.iter(txn) {
        let Some((id, name)) = split_key(key) else {
            continue;
        };
        if let Out::Any(any) = value {
            objects
                .entry(id.to_string())
                .or_default()
                .insert(name.to_string(), any);
        }
    }
    objects
}

fn object_fields<T: ReadTxn>(map: &MapRef, txn: &T, id: &str, names: &[&str]) -> HashMap<String, Any> {
    names
        .iter()
        .filter_map(|name| match map.get(txn, &entry_key(id, name)) {
            Some(Out::Any(any)) => Some((name.to_string(), any)),
            _ => None,
        })
        .collect()
}

fn decode_shape(id: String, fields: &HashMap<String, Any>) -> Option<Shape> {
    let kind = fields
        .get(field::TYPE)
        .and_then(as_str)
        .and_then(ShapeKind::parse)?;
    let number = |name: &str, fallback: f64| fields.get(name).and_then(as_f64).unwrap_or(fallback);
    let string = |name: &str| fields.get(name).and_then(as_str).map(str::to_string);

    let shape = Shape {
        id,
        kind,
        position: Point::new(number(field::X, 0.0), number(field::Y, 0.0)),
        dimensions: Size::new(
            number(field::WIDTH, MIN_DIMENSION),
            number(field::HEIGHT, MIN_DIMENSION),
        ),
        style: Style {
            fill: string(field::FILL).unwrap_or_default(),
            stroke: string(field::STROKE).unwrap_or_default(),
            stroke_width: number(field::STROKE_WIDTH, DEFAULT_STROKE_WIDTH),
            opacity: number(field::OPACITY, 1.0),
        },
        content: string(field::CONTENT),
        text_style: string(field::TEXT_STYLE).and_then(|json| serde_json::from_str(&json).ok()),
        group_id: string(field::GROUP_ID),
    };
    Some(shape.sanitized())
}

fn decode_group(id: String, fields: &HashMap<String, Any>) -> Option<Group> {
    let shape_ids: Vec<String> = match fields.get(field::SHAPE_IDS)? {
        Any::Array(items) => items.iter().filter_map(as_str).map(str::to_string).collect(),
        _ => return None,
    };
    if shape_ids.is_empty() {
        return None;
    }
    let number = |name: &str| fields.get(name).and_then(as_f64).unwrap_or(0.0);
    let group = Group {
        id,
        shape_ids,
        bounds: Rect::new(
            number(field::X),
            number(field::Y),
            number(field::WIDTH),
            number(field::HEIGHT),
        ),
        locked: fields.get(field::LOCKED).and_then(as_bool).unwrap_or(false),
    };
    Some(group.sanitized())
}

/// Materialize every shape, ordered by id.
pub fn read_shapes<T: ReadTxn>(map: &MapRef, txn: &T) -> Vec<Shape> {
    collect_objects(map, txn)
        .into_iter()
        .filter_map(|(id, fields)| decode_shape(id, &fields))
        .collect()
}

pub fn read_shape<T: ReadTxn>(map: &MapRef, txn: &T, id: &str) -> Option<Shape> {
    decode_shape(id.to_string(), &object_fields(map, txn, id, &SHAPE_FIELDS))
}

/// Materialize every group, ordered by id.
pub fn read_groups<T: ReadTxn>(map: &MapRef, txn: &T) -> Vec<Group> {
    collect_objects(map, txn)
        .into_iter()
        .filter_map(|(id, fields)| decode_group(id, &fields))
        .collect()
}

pub fn read_group<T: ReadTxn>(map: &MapRef, txn: &T, id: &str) -> Option<Group> {
    decode_group(id.to_string(), &object_fields(map, txn, id, &GROUP_FIELDS))
}

/// Number of live shapes without materializing them.
pub fn count_shapes<T: ReadTxn>(map: &MapRef, txn: &T) -> usize {
    map.iter(txn)
        .filter(|(key, value)| {
            split_key(key).map_or(false, |(_, name)| name == field::TYPE)
                && matches!(value, Out::Any(Any::String(s)) if ShapeKind::parse(s).is_some())
        })
        .count()
}
