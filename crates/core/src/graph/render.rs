//! Graph marshaling
//!
//! Renders a build graph into the daemon's dockerfile frontend format.
//! Rendering is deterministic: operation order is preserved and maps keep
//! insertion order, so identical graphs marshal byte-identically.

use super::{BuildGraph, Operation};
use std::fmt::Write;

pub(super) fn render(graph: &BuildGraph) -> String {
    let mut out = String::new();
    out.push_str("# syntax=docker/dockerfile:1\n");
    let _ = writeln!(
        out,
        "FROM --platform={} {}",
        graph.base.platform.format(),
        graph.base.image
    );

    for op in &graph.ops {
        match op {
            Operation::Run { command, mounts } => {
                out.push_str("RUN");
                for mount in mounts {
                    let _ = write!(
                        out,
                        " --mount=type=cache,id={},target={},sharing=shared",
                        mount.id, mount.target
                    );
                }
                out.push(' ');
                out.push_str(command);
                out.push('\n');
            }
            Operation::Copy {
                source,
                destination,
            } => {
                let _ = writeln!(
                    out,
                    "COPY [{}, {}]",
                    quote(&source.to_string_lossy()),
                    quote(destination)
                );
            }
            Operation::Env { key, value } => {
                let _ = writeln!(out, "ENV {}={}", key, quote(value));
            }
            Operation::Workdir(dir) => {
                let _ = writeln!(out, "WORKDIR {dir}");
            }
            Operation::User(user) => {
                let _ = writeln!(out, "USER {user}");
            }
            Operation::Label { key, value } => {
                let _ = writeln!(out, "LABEL {}={}", quote(key), quote(value));
            }
            Operation::Expose(port) => {
                let _ = writeln!(out, "EXPOSE {port}");
            }
            Operation::Volume(path) => {
                let _ = writeln!(out, "VOLUME [{}]", quote(path));
            }
            Operation::Entrypoint(argv) => {
                let _ = writeln!(out, "ENTRYPOINT {}", exec_form(argv));
            }
            Operation::Cmd(argv) => {
                let _ = writeln!(out, "CMD {}", exec_form(argv));
            }
        }
    }
    out
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn exec_form(argv: &[String]) -> String {
    let elements: Vec<String> = argv.iter().map(|arg| quote(arg)).collect();
    format!("[{}]", elements.join(", "))
}
