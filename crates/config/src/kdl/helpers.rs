//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument, e.g.
//! `email "admin@example.com"` inside an `acme { ... }` block.

use kdl::{KdlNode, KdlValue};

/// First positional argument of a node
fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

/// Child node with the given name
pub fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)
}

/// All child nodes with the given name
pub fn children_named<'a>(node: &'a KdlNode, name: &'a str) -> impl Iterator<Item = &'a KdlNode> {
    node.children()
        .into_iter()
        .flat_map(|doc| doc.nodes().iter())
        .filter(move |n| n.name().value() == name)
}

/// First argument of a node as a string
pub fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

/// String argument of the named child node
pub fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    child(node, name).and_then(get_first_arg_string)
}

/// Integer argument of the named child node
pub fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    child(node, name)
        .and_then(first_arg)
        .and_then(|v| v.as_integer())
}

/// Boolean argument of the named child node
pub fn get_bool_entry(node: &KdlNode, name: &str) -> Option<bool> {
    child(node, name).and_then(first_arg).and_then(|v| v.as_bool())
}
