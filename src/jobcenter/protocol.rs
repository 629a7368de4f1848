use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobcenter::queues::Job;


/// One request per line, selected by the `request` field. An absent `wait`
///  on a get means "do not wait".
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum Request {
    Put { queue: String, job: Value, pri: i64 },
    Get {
        queues: Vec<String>,
        #[serde(default)]
        wait: bool,
    },
    Delete { id: u64 },
    Abort { id: u64 },
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Ok,
    NoJob,
    Error,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pri: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn empty(status: Status) -> Response {
        Response { status, id: None, job: None, pri: None, queue: None, error: None }
    }

    pub fn ok() -> Response {
        Response::empty(Status::Ok)
    }

    pub fn put_ok(id: u64) -> Response {
        Response { id: Some(id), ..Response::empty(Status::Ok) }
    }

    pub fn claimed(job: &Job) -> Response {
        Response {
            id: Some(job.id),
            job: Some(job.content.clone()),
            pri: Some(job.priority),
            queue: Some(job.queue.clone()),
            ..Response::empty(Status::Ok)
        }
    }

    pub fn no_job() -> Response {
        Response::empty(Status::NoJob)
    }

    pub fn error(message: impl Into<String>) -> Response {
        Response { error: Some(message.into()), ..Response::empty(Status::Error) }
    }

    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"error","error":"response could not be serialized"}"#.to_string()
        });
        line.push('\n');
        line
    }
}
