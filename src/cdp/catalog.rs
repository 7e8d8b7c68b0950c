//! Static CDP method catalog backing `bdg cdp --list/--describe/--search`
//! (spec.md §1 Non-goals: "The CDP schema catalog ... is pure data;
//! trivially re-serialized" — SPEC_FULL.md's Non-goals section narrows
//! this further to "a small static table sufficient to demonstrate the
//! interface, not a full protocol.json import").
//!
//! Modeled on the descriptor-struct style of the teacher's
//! `capabilities::CommandDescriptor` (plain serde structs describing a
//! fixed shape, not a clap-tree walk).

use serde::Serialize;

/// One entry in the built-in catalog.
#[derive(Debug, Clone, Serialize)]
pub struct MethodDescriptor {
    pub method: &'static str,
    pub domain: &'static str,
    pub description: &'static str,
}

/// The methods this crate itself issues, plus a handful of commonly
/// requested ones for passthrough/introspection demonstration purposes.
pub const CATALOG: &[MethodDescriptor] = &[
    MethodDescriptor {
        method: "Target.createTarget",
        domain: "Target",
        description: "Create a new page target and return its targetId.",
    },
    MethodDescriptor {
        method: "Target.attachToTarget",
        domain: "Target",
        description: "Attach to a target, creating a flat-mode session for it.",
    },
    MethodDescriptor {
        method: "Network.enable",
        domain: "Network",
        description: "Enable network tracking; requestWillBeSent and friends start firing.",
    },
    MethodDescriptor {
        method: "Network.getResponseBody",
        domain: "Network",
        description: "Return the body of a completed request by requestId.",
    },
    MethodDescriptor {
        method: "Runtime.enable",
        domain: "Runtime",
        description: "Enable the Runtime domain; consoleAPICalled and exceptionThrown start firing.",
    },
    MethodDescriptor {
        method: "Runtime.evaluate",
        domain: "Runtime",
        description: "Evaluate a JavaScript expression in the page's default execution context.",
    },
    MethodDescriptor {
        method: "Log.enable",
        domain: "Log",
        description: "Enable the Log domain (browser-originated log entries).",
    },
    MethodDescriptor {
        method: "Page.enable",
        domain: "Page",
        description: "Enable page lifecycle events.",
    },
    MethodDescriptor {
        method: "Page.navigate",
        domain: "Page",
        description: "Navigate the page's main frame to a URL.",
    },
    MethodDescriptor {
        method: "Page.getFrameTree",
        domain: "Page",
        description: "Return the page's frame tree, including the main frame's URL.",
    },
    MethodDescriptor {
        method: "DOM.enable",
        domain: "DOM",
        description: "Enable the DOM domain.",
    },
    MethodDescriptor {
        method: "DOM.getDocument",
        domain: "DOM",
        description: "Return the root DOM node. depth:-1 returns the entire subtree.",
    },
    MethodDescriptor {
        method: "DOM.getOuterHTML",
        domain: "DOM",
        description: "Return the node's outerHTML by nodeId.",
    },
];

/// Find one entry by exact method name (case-sensitive, matching CDP's own
/// `Domain.method` casing).
#[must_use]
pub fn describe(method: &str) -> Option<&'static MethodDescriptor> {
    CATALOG.iter().find(|m| m.method == method)
}

/// Case-insensitive substring search over method name and description.
#[must_use]
pub fn search(query: &str) -> Vec<&'static MethodDescriptor> {
    let needle = query.to_lowercase();
    CATALOG
        .iter()
        .filter(|m| m.method.to_lowercase().contains(&needle) || m.description.to_lowercase().contains(&needle))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_finds_known_method() {
        let entry = describe("Page.navigate").unwrap();
        assert_eq!(entry.domain, "Page");
    }

    #[test]
    fn describe_unknown_method_is_none() {
        assert!(describe("Foo.bar").is_none());
    }

    #[test]
    fn search_is_case_insensitive() {
        let results = search("network");
        assert!(!results.is_empty());
        assert!(results.iter().all(|m| m.domain == "Network"));
    }

    #[test]
    fn search_matches_description_text() {
        let results = search("outerhtml");
        assert!(results.iter().any(|m| m.method == "DOM.getOuterHTML"));
    }
}
