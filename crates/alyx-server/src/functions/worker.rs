use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::functions::discovery::Runtime;

/// Node bootstrap: reads one request line, loads the named module,
/// runs its export, answers with a result line. `log` and `db`
/// messages stream back over the same pipe.
const NODE_BOOTSTRAP: &str = r#"
const readline = require('readline');
const rl = readline.createInterface({ input: process.stdin });
const send = (obj) => process.stdout.write(JSON.stringify(obj) + '\n');
rl.on('line', async (line) => {
  let req;
  try { req = JSON.parse(line); } catch (e) { return send({ type: 'error', message: 'bad request: ' + e.message }); }
  const ctx = req.ctx || {};
  ctx.log = (...args) => send({ type: 'log', message: args.map(String).join(' ') });
  try {
    const mod = require(req.function);
    const fn = mod.default || mod.run || mod;
    const output = await fn(req.input, ctx);
    send({ type: 'result', output: output === undefined ? null : output });
  } catch (e) {
    send({ type: 'error', message: String(e && e.message || e) });
  }
});
"#;

/// Python bootstrap: same line protocol.
const PYTHON_BOOTSTRAP: &str = r#"
import sys, json, importlib.util

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    try:
        req = json.loads(line)
    except Exception as e:
        send({"type": "error", "message": "bad request: %s" % e})
        continue
    ctx = req.get("ctx") or {}
    ctx["log"] = lambda *args: send({"type": "log", "message": " ".join(str(a) for a in args)})
    try:
        spec = importlib.util.spec_from_file_location("fn", req["function"])
        mod = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(mod)
        output = mod.run(req.get("input"), ctx)
        send({"type": "result", "output": output})
    except Exception as e:
        send({"type": "error", "message": str(e)})
"#;

/// A message the worker sends back over its stdout pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Log(String),
    /// A data-layer call the host must answer (policy applies).
    Db(serde_json::Value),
    Result(serde_json::Value),
    Error(String),
}

impl WorkerMessage {
    fn parse(line: &str) -> Self {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
            // Bare stdout noise is still captured as a log line.
            return Self::Log(line.to_string());
        };
        match json.get("type").and_then(|t| t.as_str()) {
            Some("log") => Self::Log(
                json.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string(),
            ),
            Some("db") => Self::Db(json),
            Some("result") => Self::Result(json.get("output").cloned().unwrap_or(serde_json::Value::Null)),
            Some("error") => Self::Error(
                json.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            ),
            _ => Self::Log(line.to_string()),
        }
    }
}

/// Why an invocation ended without a result.
#[derive(Debug)]
pub enum WorkerFailure {
    /// Deadline hit; the worker must be killed, never reused.
    TimedOut,
    /// The process died or closed its pipe mid-call.
    Crashed(String),
}

/// A warm runtime process with a JSON-line RPC channel.
///
/// One worker serves one invocation at a time. A worker that times
/// out is killed by the pool and never returned to it.
#[derive(Debug)]
pub struct Worker {
    pub id: String,
    pub runtime: Runtime,
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    /// Set on release; the reaper drains workers idle too long.
    pub idle_since: Instant,
}

impl Worker {
    /// Spawns a runtime process and waits for nothing: the bootstrap
    /// is ready as soon as the pipe is open.
    ///
    /// Node and Python workers are generic: the bootstrap loads the
    /// module named by each request, so one pool serves every function
    /// of the runtime. Go has no late loading; its workers are pinned
    /// to one `preload` source that speaks the line protocol itself.
    pub async fn spawn(
        runtime: Runtime,
        preload: Option<&Path>,
        env: &BTreeMap<String, String>,
        memory_limit_mb: u64,
    ) -> Result<Self, std::io::Error> {
        let mut command = match runtime {
            Runtime::Node => {
                let mut c = Command::new("node");
                c.arg(format!("--max-old-space-size={memory_limit_mb}"));
                c.arg("-e").arg(NODE_BOOTSTRAP);
                c
            }
            Runtime::Python => {
                let mut c = Command::new("python3");
                c.arg("-u").arg("-c").arg(PYTHON_BOOTSTRAP);
                c
            }
            Runtime::Go => {
                let mut c = Command::new("go");
                c.arg("run");
                if let Some(path) = preload {
                    c.arg(path);
                }
                c
            }
        };

        command
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        let worker = Self {
            id: uuid::Uuid::new_v4().to_string(),
            runtime,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            idle_since: Instant::now(),
        };
        debug!(worker = %worker.id, runtime = %runtime, "worker spawned");
        Ok(worker)
    }

    /// Runs one invocation under `timeout`.
    ///
    /// `on_db` answers mid-call data-layer requests; its reply is
    /// written straight back to the worker. Collected log lines are
    /// returned alongside the outcome.
    pub async fn invoke(
        &mut self,
        function_path: &Path,
        input: &serde_json::Value,
        ctx: &serde_json::Value,
        timeout: Duration,
        mut on_db: impl FnMut(&serde_json::Value) -> serde_json::Value,
    ) -> (Vec<String>, Result<serde_json::Value, WorkerFailure>) {
        let mut logs = Vec::new();
        let request = serde_json::json!({
            "function": function_path,
            "input": input,
            "ctx": ctx,
        });

        let deadline = tokio::time::Instant::now() + timeout;
        let mut line = request.to_string();
        line.push('\n');
        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            return (logs, Err(WorkerFailure::Crashed(e.to_string())));
        }

        loop {
            let next = tokio::time::timeout_at(deadline, self.stdout.next_line()).await;
            match next {
                Err(_) => return (logs, Err(WorkerFailure::TimedOut)),
                Ok(Err(e)) => return (logs, Err(WorkerFailure::Crashed(e.to_string()))),
                Ok(Ok(None)) => {
                    return (
                        logs,
                        Err(WorkerFailure::Crashed("worker closed its pipe".to_string())),
                    )
                }
                Ok(Ok(Some(text))) => match WorkerMessage::parse(&text) {
                    WorkerMessage::Log(message) => logs.push(message),
                    WorkerMessage::Db(request) => {
                        let reply = on_db(&request);
                        let mut out = reply.to_string();
                        out.push('\n');
                        if let Err(e) = self.stdin.write_all(out.as_bytes()).await {
                            return (logs, Err(WorkerFailure::Crashed(e.to_string())));
                        }
                    }
                    WorkerMessage::Result(output) => return (logs, Ok(output)),
                    WorkerMessage::Error(message) => {
                        return (logs, Err(WorkerFailure::Crashed(message)))
                    }
                },
            }
        }
    }

    /// Hard-kills the process. Used on timeout and shutdown.
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(worker = %self.id, error = %e, "worker kill failed");
        }
    }
}
