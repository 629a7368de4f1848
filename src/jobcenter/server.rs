use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::jobcenter::protocol::{Request, Response};
use crate::jobcenter::queues::{AbortOutcome, QueueManager};


pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.job_port)).await?;
    info!("job center listening on port {}/tcp", config.job_port);
    serve(listener, Arc::new(QueueManager::new())).await
}

pub async fn serve(listener: TcpListener, manager: Arc<QueueManager>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                error!("error accepting connection: {}", e);
                continue;
            }
        };
        tokio::spawn(handle_connection(stream, peer, manager.clone()));
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, manager: Arc<QueueManager>) {
    let client = Uuid::new_v4();
    debug!(%client, "handling connection from {}", peer);

    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(%client, "read error: {}", e);
                break;
            }
        };

        // bad lines are reported but never end the conversation
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, client, &manager).await,
            Err(e) => Response::error(format!("invalid request: {}", e)),
        };

        if write.write_all(response.to_line().as_bytes()).await.is_err() {
            break;
        }
    }

    manager.release_client(client);
    debug!(%client, "connection done");
}

async fn dispatch(request: Request, client: Uuid, manager: &QueueManager) -> Response {
    match request {
        Request::Put { queue, job, pri } => {
            let id = manager.put(&queue, pri, job);
            Response::put_ok(id)
        }
        Request::Get { queues, wait } => match manager.try_claim(&queues, client) {
            Some(job) => Response::claimed(&job),
            None if wait => Response::claimed(manager.claim_waiting(&queues, client).await.as_ref()),
            None => Response::no_job(),
        },
        Request::Delete { id } => {
            if manager.delete(id) {
                Response::ok()
            } else {
                Response::no_job()
            }
        }
        Request::Abort { id } => match manager.abort(id, client) {
            AbortOutcome::Aborted => Response::ok(),
            AbortOutcome::NoSuchJob => Response::no_job(),
            AbortOutcome::NotHolder => {
                Response::error(format!("job {} is not held by this client", id))
            }
        },
    }
}


#[cfg(test)]
mod test {
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;

    use super::*;

    struct TestClient {
        write: tokio::net::tcp::OwnedWriteHalf,
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> TestClient {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            TestClient { write, lines: BufReader::new(read).lines() }
        }

        async fn request(&mut self, body: Value) -> Value {
            self.send(&body.to_string()).await;
            self.receive().await
        }

        async fn send(&mut self, line: &str) {
            self.write.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        }

        async fn receive(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(QueueManager::new())));
        addr
    }

    #[tokio::test]
    async fn test_put_get_delete_cycle() {
        let addr = start().await;
        let mut client = TestClient::connect(addr).await;

        let put = client
            .request(json!({"request":"put","queue":"q1","job":{"n":1},"pri":10}))
            .await;
        assert_eq!(put["status"], "ok");
        let id = put["id"].clone();

        let get = client.request(json!({"request":"get","queues":["q1"]})).await;
        assert_eq!(get["status"], "ok");
        assert_eq!(get["id"], id);
        assert_eq!(get["job"], json!({"n":1}));
        assert_eq!(get["pri"], 10);
        assert_eq!(get["queue"], "q1");

        let delete = client.request(json!({"request":"delete","id":id})).await;
        assert_eq!(delete["status"], "ok");

        let get = client.request(json!({"request":"get","queues":["q1"]})).await;
        assert_eq!(get["status"], "no-job");
    }

    #[tokio::test]
    async fn test_malformed_lines_keep_the_connection_open() {
        let addr = start().await;
        let mut client = TestClient::connect(addr).await;

        client.send("this is not json").await;
        assert_eq!(client.receive().await["status"], "error");

        client.send(r#"{"request":"levitate"}"#).await;
        assert_eq!(client.receive().await["status"], "error");

        let put = client
            .request(json!({"request":"put","queue":"q1","job":null,"pri":0}))
            .await;
        assert_eq!(put["status"], "ok");
    }

    #[tokio::test]
    async fn test_disconnect_returns_held_jobs() {
        let addr = start().await;

        let mut producer = TestClient::connect(addr).await;
        let put = producer
            .request(json!({"request":"put","queue":"q1","job":"j","pri":5}))
            .await;
        let id = put["id"].clone();

        let mut worker = TestClient::connect(addr).await;
        let get = worker.request(json!({"request":"get","queues":["q1"]})).await;
        assert_eq!(get["id"], id);
        drop(worker);

        // the job becomes claimable again once the worker is gone
        let mut successor = TestClient::connect(addr).await;
        let get = successor
            .request(json!({"request":"get","queues":["q1"],"wait":true}))
            .await;
        assert_eq!(get["status"], "ok");
        assert_eq!(get["id"], id);
    }

    #[tokio::test]
    async fn test_waiting_get_blocks_until_a_put() {
        let addr = start().await;

        let mut waiter = TestClient::connect(addr).await;
        waiter.send(r#"{"request":"get","queues":["later"],"wait":true}"#).await;

        let mut producer = TestClient::connect(addr).await;
        let put = producer
            .request(json!({"request":"put","queue":"later","job":42,"pri":1}))
            .await;

        let get = waiter.receive().await;
        assert_eq!(get["status"], "ok");
        assert_eq!(get["id"], put["id"]);
        assert_eq!(get["job"], 42);
    }

    #[tokio::test]
    async fn test_abort_by_a_non_holder_is_an_error() {
        let addr = start().await;

        let mut holder = TestClient::connect(addr).await;
        let put = holder
            .request(json!({"request":"put","queue":"q1","job":"j","pri":1}))
            .await;
        let id = put["id"].clone();
        holder.request(json!({"request":"get","queues":["q1"]})).await;

        let mut stranger = TestClient::connect(addr).await;
        let abort = stranger.request(json!({"request":"abort","id":id})).await;
        assert_eq!(abort["status"], "error");

        let abort = holder.request(json!({"request":"abort","id":id})).await;
        assert_eq!(abort["status"], "ok");
    }
}
