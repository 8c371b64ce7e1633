//! View definitions shared by every store implementation.
//!
//! Each view is a map function over one document emitting at most one
//! `(key, value)` row. `InMemoryStore` evaluates the Rust closure, `CouchStore`
//! installs the JavaScript twin as a design document. The two must agree.

use std::cmp::Ordering;

use serde_json::{Value, json};

use crate::ports::Document;

pub type MapFn = fn(&Document) -> Option<(Value, Value)>;

#[derive(Clone, Copy)]
pub struct ViewDef {
    pub name: &'static str,
    /// Design document (`_design/<design>`) holding the view.
    pub design: &'static str,
    pub map: MapFn,
    pub js: &'static str,
}

impl std::fmt::Debug for ViewDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewDef")
            .field("name", &self.name)
            .field("design", &self.design)
            .finish()
    }
}

pub const TASK_DESIGN: &str = "tasks";
pub const JOB_DESIGN: &str = "jobs";

/// Task views listed by `pilot summary`, in display order.
pub const TASK_OVERVIEW: [&str; 4] = ["pending", "in_progress", "error", "done"];

/// Job views listed by `pilot summary`, in display order.
pub const JOB_OVERVIEW: [&str; 4] = [
    "pending_jobs",
    "running_jobs",
    "finished_jobs",
    "archived_jobs",
];

fn is_type(doc: &Document, ty: &str) -> bool {
    doc.doc_type() == Some(ty)
}

fn task_value(doc: &Document) -> Value {
    json!({
        "lock": doc.int("lock"),
        "done": doc.int("done"),
        "job": doc.get("job").cloned().unwrap_or(Value::Null),
    })
}

fn job_value(doc: &Document) -> Value {
    json!({
        "queue": doc.int("queue"),
        "start": doc.int("start"),
        "done": doc.int("done"),
        "archive": doc.int("archive"),
        "cancel": doc.int("cancel"),
        "batch_id": doc.get("batch_id").cloned().unwrap_or(Value::Null),
        "host": doc.get("host").cloned().unwrap_or(Value::Null),
        "method": doc.get("method").cloned().unwrap_or(Value::Null),
    })
}

fn pending(doc: &Document) -> Option<(Value, Value)> {
    (is_type(doc, "task") && doc.int("lock") == 0 && doc.int("done") == 0)
        .then(|| (json!(doc.id), task_value(doc)))
}

fn pending_priority(doc: &Document) -> Option<(Value, Value)> {
    let priority = doc.get("priority")?.as_i64()?;
    pending(doc).map(|(_, value)| (json!([-priority, doc.id]), value))
}

fn in_progress(doc: &Document) -> Option<(Value, Value)> {
    (is_type(doc, "task") && doc.int("lock") > 0 && doc.int("done") == 0)
        .then(|| (json!(doc.int("lock")), task_value(doc)))
}

fn done(doc: &Document) -> Option<(Value, Value)> {
    (is_type(doc, "task") && doc.int("done") > 0)
        .then(|| (json!(doc.int("done")), task_value(doc)))
}

fn error(doc: &Document) -> Option<(Value, Value)> {
    let has_errors = doc
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| !errors.is_empty());
    (is_type(doc, "task") && has_errors).then(|| (json!(doc.id), task_value(doc)))
}

fn job_open(doc: &Document) -> bool {
    is_type(doc, "job") && doc.int("done") == 0 && doc.int("archive") == 0
}

fn pending_jobs(doc: &Document) -> Option<(Value, Value)> {
    (job_open(doc) && doc.int("queue") > 0 && doc.int("start") == 0)
        .then(|| (json!(doc.int("queue")), job_value(doc)))
}

fn running_jobs(doc: &Document) -> Option<(Value, Value)> {
    (job_open(doc) && doc.int("start") > 0).then(|| (json!(doc.int("start")), job_value(doc)))
}

fn active_jobs(doc: &Document) -> Option<(Value, Value)> {
    let submitted = doc.int("queue").max(doc.int("start"));
    (job_open(doc) && submitted > 0 && doc.int("cancel") == 0)
        .then(|| (json!(submitted), job_value(doc)))
}

fn finished_jobs(doc: &Document) -> Option<(Value, Value)> {
    (is_type(doc, "job") && doc.int("done") > 0 && doc.int("archive") == 0)
        .then(|| (json!(doc.int("done")), job_value(doc)))
}

fn archived_jobs(doc: &Document) -> Option<(Value, Value)> {
    (is_type(doc, "job") && doc.int("archive") > 0)
        .then(|| (json!(doc.int("archive")), job_value(doc)))
}

// The value objects in the JS bodies mirror task_value / job_value.
macro_rules! task_js {
    ($cond:literal, $key:literal) => {
        concat!(
            "function(doc) { if (doc.type === 'task' && ",
            $cond,
            ") { emit(",
            $key,
            ", {lock: doc.lock || 0, done: doc.done || 0, job: doc.job || null}); } }"
        )
    };
}

macro_rules! job_js {
    ($cond:literal, $key:literal) => {
        concat!(
            "function(doc) { if (doc.type === 'job' && ",
            $cond,
            ") { emit(",
            $key,
            ", {queue: doc.queue || 0, start: doc.start || 0, done: doc.done || 0, ",
            "archive: doc.archive || 0, cancel: doc.cancel || 0, batch_id: doc.batch_id || null, ",
            "host: doc.host || null, method: doc.method || null}); } }"
        )
    };
}

const PENDING: ViewDef = ViewDef {
    name: "pending",
    design: TASK_DESIGN,
    map: pending,
    js: task_js!("!doc.lock && !doc.done", "doc._id"),
};

const IN_PROGRESS_JS: &str = task_js!("doc.lock > 0 && !doc.done", "doc.lock");

pub const VIEWS: &[ViewDef] = &[
    PENDING,
    ViewDef {
        name: "pending_priority",
        design: TASK_DESIGN,
        map: pending_priority,
        js: task_js!(
            "!doc.lock && !doc.done && typeof doc.priority === 'number'",
            "[-doc.priority, doc._id]"
        ),
    },
    ViewDef {
        name: "in_progress",
        design: TASK_DESIGN,
        map: in_progress,
        js: IN_PROGRESS_JS,
    },
    ViewDef {
        name: "locked",
        design: TASK_DESIGN,
        map: in_progress,
        js: IN_PROGRESS_JS,
    },
    ViewDef {
        name: "done",
        design: TASK_DESIGN,
        map: done,
        js: task_js!("doc.done > 0", "doc.done"),
    },
    ViewDef {
        name: "error",
        design: TASK_DESIGN,
        map: error,
        js: task_js!("doc.errors && doc.errors.length > 0", "doc._id"),
    },
    ViewDef {
        name: "pending_jobs",
        design: JOB_DESIGN,
        map: pending_jobs,
        js: job_js!(
            "doc.queue > 0 && !doc.start && !doc.done && !doc.archive",
            "doc.queue"
        ),
    },
    ViewDef {
        name: "running_jobs",
        design: JOB_DESIGN,
        map: running_jobs,
        js: job_js!("doc.start > 0 && !doc.done && !doc.archive", "doc.start"),
    },
    ViewDef {
        name: "active_jobs",
        design: JOB_DESIGN,
        map: active_jobs,
        js: job_js!(
            "(doc.queue > 0 || doc.start > 0) && !doc.done && !doc.archive && !doc.cancel",
            "Math.max(doc.queue || 0, doc.start || 0)"
        ),
    },
    ViewDef {
        name: "finished_jobs",
        design: JOB_DESIGN,
        map: finished_jobs,
        js: job_js!("doc.done > 0 && !doc.archive", "doc.done"),
    },
    ViewDef {
        name: "archived_jobs",
        design: JOB_DESIGN,
        map: archived_jobs,
        js: job_js!("doc.archive > 0", "doc.archive"),
    },
];

pub fn lookup(name: &str) -> Option<&'static ViewDef> {
    VIEWS.iter().find(|v| v.name == name)
}

pub fn in_design(design: &str) -> impl Iterator<Item = &'static ViewDef> + '_ {
    VIEWS.iter().filter(move |v| v.design == design)
}

/// Key collation: null < bool < number < string < array < object.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = collate(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}
