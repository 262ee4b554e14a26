//! Planner / Manager / ExecutorAgent 集成测试，以及 OpenAI 兼容传输对本地 mock HTTP 服务的端到端测试

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use conductor::agent::{create_agent_components, AgentComponents, FINAL_ANSWER_TOOL};
use conductor::config::AppConfig;
use conductor::core::{AgentError, InteractionKind, InteractionResponse, InterceptionChannel, LlmError};
use conductor::llm::mock::{raw_tool_call_response, tool_call_response};
use conductor::llm::{ChatCompletionRequest, ChatTransport, OpenAiTransport, RequestExecutor, RetryConfig, ScriptedTransport};
use conductor::memory::{DelegationStatus, Message};
use conductor::react::{Delegate, PlanOutcome, Termination};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn components(transport: Arc<dyn ChatTransport>, channel: Option<InterceptionChannel>) -> AgentComponents {
    let mut cfg = AppConfig::default();
    cfg.retry.base_delay_ms = 1;
    cfg.llm.model = "test-model".to_string();
    create_agent_components(cfg, transport, channel)
}

fn tool_names(request: &ChatCompletionRequest) -> Vec<String> {
    request.tools.iter().map(|t| t.name.clone()).collect()
}

#[tokio::test]
async fn test_planner_creates_plan() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(tool_call_response(
        "p1",
        "create_plan",
        json!({"summary": "Tidy the repo", "steps": ["List files", " ", "Remove temp files"]}),
    ))]));
    let planner = components(transport.clone(), None).planner();

    let outcome = planner.plan("clean up the repo", &CancellationToken::new()).await.unwrap();

    match outcome {
        PlanOutcome::Plan(plan) => {
            assert_eq!(plan.summary, "Tidy the repo");
            assert_eq!(plan.steps, vec!["List files".to_string(), "Remove temp files".to_string()]);
        }
        other => panic!("expected a plan, got {:?}", other),
    }
    // 没有交互通道时不提供提问工具
    assert!(!tool_names(&transport.requests()[0]).contains(&"ask_clarifying_question".to_string()));
}

#[tokio::test]
async fn test_planner_responds_directly() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(tool_call_response(
        "p1",
        "respond_directly",
        json!({"message": "Hello! How can I help?"}),
    ))]));
    let planner = components(transport, None).planner();

    let outcome = planner.plan("hi", &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, PlanOutcome::Direct("Hello! How can I help?".to_string()));
}

#[tokio::test]
async fn test_planner_asks_clarifying_question_then_plans() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(tool_call_response(
            "p1",
            "ask_clarifying_question",
            json!({"question": "Which language?", "options": ["Rust", "Go"]}),
        )),
        Ok(tool_call_response(
            "p2",
            "create_plan",
            json!({"summary": "Write it in Rust", "steps": ["cargo new", "implement"]}),
        )),
    ]));
    let (channel, mut requests) = InterceptionChannel::new(Duration::from_secs(300));
    let responder = channel.clone();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            if let InteractionKind::Question { options, .. } = &request.kind {
                assert_eq!(options.len(), 2);
            }
            responder.resolve(&request.id, InteractionResponse::Answer("Rust".to_string()));
        }
    });
    let planner = components(transport.clone(), Some(channel)).planner();

    let outcome = planner.plan("write a CLI", &CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, PlanOutcome::Plan(ref p) if p.steps.len() == 2));
    let second = &transport.requests()[1];
    let answer = second.messages.last().unwrap();
    assert!(answer.content.contains("Which language?"));
    assert!(answer.content.contains("Rust"));
    assert!(tool_names(&transport.requests()[0]).contains(&"ask_clarifying_question".to_string()));
}

#[tokio::test]
async fn test_planner_falls_back_to_request_on_invalid_calls() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(raw_tool_call_response("p1", "create_plan", "{oops")),
        Ok(raw_tool_call_response("p2", "create_plan", "{oops")),
        Ok(raw_tool_call_response("p3", "create_plan", "{oops")),
    ]));
    let planner = components(transport, None).planner();

    let outcome = planner.plan("migrate the database", &CancellationToken::new()).await.unwrap();
    match outcome {
        PlanOutcome::Plan(plan) => assert_eq!(plan.steps, vec!["migrate the database".to_string()]),
        other => panic!("expected fallback plan, got {:?}", other),
    }
}

struct Worker {
    calls: AtomicUsize,
}

#[async_trait]
impl Delegate for Worker {
    async fn delegate(&self, task: &str, _cancel: &CancellationToken) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} finished", task))
    }
}

#[tokio::test]
async fn test_manager_cycle_delegates_remembers_and_reports() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(tool_call_response("m1", "delegate_task", json!({"task": "count files"}))),
        Ok(tool_call_response("m2", "remember", json!({"key": "files", "content": "42"}))),
        Ok(tool_call_response("m3", "report_to_user", json!({"message": "There are 42 files."}))),
    ]));
    let parts = components(transport.clone(), None);
    let worker = Arc::new(Worker {
        calls: AtomicUsize::new(0),
    });
    let mut config = conductor::react::ManagerConfig::new("test-model");
    config.max_iterations = 5;
    let manager = conductor::react::Manager::new(
        parts.executor.clone(),
        parts.recovery.clone(),
        worker.clone(),
        None,
        config,
    );

    let outcome = manager.run_cycle("keep an eye on the repo", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.termination, Termination::Completed);
    assert_eq!(outcome.message, "There are 42 files.");
    assert_eq!(outcome.tool_call_history.len(), 2);
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);

    let memory = manager.memory();
    let memory = memory.lock().unwrap();
    assert_eq!(memory.note("files"), Some("42"));
    assert_eq!(memory.delegations()[0].status, DelegationStatus::Succeeded);

    // rebuild 模式：每轮的 system prompt 都反映最新的工作记忆
    let requests = transport.requests();
    assert!(requests[1].messages[0].content.contains("count files finished"));
    assert!(requests[2].messages[0].content.contains("files: 42"));
    assert!(!requests[0].messages[0].content.contains("files: 42"));
}

#[tokio::test(start_paused = true)]
async fn test_manager_runs_periodically_until_cancelled() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(tool_call_response("m1", "report_to_user", json!({"message": "all quiet"}))),
        Ok(tool_call_response("m2", "report_to_user", json!({"message": "still quiet"}))),
    ]));
    let parts = components(transport, None);
    let manager = parts.manager();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        // 第一次立即触发，第二次在 60 秒后
        tokio::time::sleep(Duration::from_secs(90)).await;
        trigger.cancel();
    });

    let mut reports = Vec::new();
    let cycles = manager
        .run_periodic("watch", &cancel, |outcome| reports.push(outcome.message))
        .await
        .unwrap();

    assert_eq!(cycles, 2);
    assert_eq!(reports, vec!["all quiet".to_string(), "still quiet".to_string()]);
}

#[tokio::test]
async fn test_manager_delegates_to_executor_agent() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(tool_call_response("m1", "delegate_task", json!({"task": "say hi"}))),
        // 下级 ExecutorAgent 的两轮
        Ok(tool_call_response("e1", "echo", json!({"text": "hi"}))),
        Ok(tool_call_response("e2", FINAL_ANSWER_TOOL, json!({"message": "said hi"}))),
        Ok(tool_call_response("m2", "report_to_user", json!({"message": "Worker said hi."}))),
    ]));
    let manager = components(transport, None).manager();

    let outcome = manager.run_cycle("greet", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.message, "Worker said hi.");
    assert_eq!(outcome.tool_call_history[0].result, "said hi");
}

#[tokio::test]
async fn test_executor_agent_reads_workspace_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();
    let transport = Arc::new(ScriptedTransport::new(vec![
        Ok(tool_call_response("e1", "read_file", json!({"path": "notes.txt"}))),
        Ok(tool_call_response("e2", FINAL_ANSWER_TOOL, json!({"message": "It says: remember the milk"}))),
    ]));
    let mut cfg = AppConfig::default();
    cfg.tools.workspace_root = Some(dir.path().to_path_buf());
    let agent = create_agent_components(cfg, transport, None).executor_agent();

    let outcome = agent.run("what is in notes.txt?", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.tool_call_history[0].result, "remember the milk");
    assert_eq!(outcome.message, "It says: remember the milk");
}

#[tokio::test]
async fn test_executor_agent_with_channel_offers_interaction_tools() {
    let transport = Arc::new(ScriptedTransport::new(vec![Ok(tool_call_response(
        "e1",
        FINAL_ANSWER_TOOL,
        json!({"message": "done"}),
    ))]));
    let (channel, _requests) = InterceptionChannel::new(Duration::from_secs(300));
    let agent = components(transport.clone(), Some(channel)).executor_agent();

    agent.run("anything", &CancellationToken::new()).await.unwrap();

    let names = tool_names(&transport.requests()[0]);
    assert!(names.contains(&"ask_user".to_string()));
    assert!(names.contains(&"request_approval".to_string()));
    assert!(names.contains(&FINAL_ANSWER_TOOL.to_string()));
}

/// 每个数组参数都必须带 items，否则 OpenAI 兼容端点直接返回 400
fn array_params_without_items(request: &ChatCompletionRequest) -> Vec<String> {
    let wire = request.to_wire_json();
    let mut missing = Vec::new();
    for tool in wire["tools"].as_array().cloned().unwrap_or_default() {
        let name = tool["function"]["name"].as_str().unwrap_or_default().to_string();
        let props = tool["function"]["parameters"]["properties"].as_object().cloned().unwrap_or_default();
        for (field, schema) in props {
            if schema["type"] == "array" && schema.get("items").is_none() {
                missing.push(format!("{}.{}", name, field));
            }
        }
    }
    missing
}

#[tokio::test]
async fn test_wire_tools_declare_array_items() {
    let plan_transport = Arc::new(ScriptedTransport::new(vec![Ok(tool_call_response(
        "p1",
        "create_plan",
        json!({"summary": "s", "steps": ["one"]}),
    ))]));
    let (channel, _plan_requests) = InterceptionChannel::new(Duration::from_secs(300));
    components(plan_transport.clone(), Some(channel))
        .planner()
        .plan("write a CLI", &CancellationToken::new())
        .await
        .unwrap();

    let run_transport = Arc::new(ScriptedTransport::new(vec![Ok(tool_call_response(
        "e1",
        FINAL_ANSWER_TOOL,
        json!({"message": "done"}),
    ))]));
    let (channel, _run_requests) = InterceptionChannel::new(Duration::from_secs(300));
    components(run_transport.clone(), Some(channel))
        .executor_agent()
        .run("anything", &CancellationToken::new())
        .await
        .unwrap();

    let plan_request = &plan_transport.requests()[0];
    let run_request = &run_transport.requests()[0];
    assert!(tool_names(plan_request).contains(&"create_plan".to_string()));
    assert!(tool_names(plan_request).contains(&"ask_clarifying_question".to_string()));
    assert!(tool_names(run_request).contains(&"ask_user".to_string()));
    assert_eq!(array_params_without_items(plan_request), Vec::<String>::new());
    assert_eq!(array_params_without_items(run_request), Vec::<String>::new());

    let wire = plan_request.to_wire_json();
    let create_plan = wire["tools"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["function"]["name"] == "create_plan")
        .unwrap()
        .clone();
    assert_eq!(
        create_plan["function"]["parameters"]["properties"]["steps"]["items"]["type"],
        "string"
    );
}

// ---- OpenAI 兼容 HTTP 传输 ----

struct MockHttpResponse {
    status: u16,
    body: String,
    retry_after: Option<u64>,
}

fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    let mut header_end = None;
    while header_end.is_none() {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    }
    let header_len = header_end.unwrap_or(buffer.len());
    let headers = String::from_utf8_lossy(&buffer[..header_len]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buffer[header_len..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    Ok(String::from_utf8_lossy(&body).to_string())
}

/// 按脚本依次回应请求；返回 base_url 与收到的请求计数
fn spawn_mock_server(scripted: Vec<MockHttpResponse>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("addr");
    let count = Arc::new(AtomicUsize::new(0));
    let count_thread = count.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let _ = consume_http_request(&mut stream);
            let idx = count_thread.fetch_add(1, Ordering::SeqCst);
            let Some(selected) = scripted.get(idx).or_else(|| scripted.last()) else { break };
            let mut head = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                selected.status,
                selected.body.len()
            );
            if let Some(secs) = selected.retry_after {
                head.push_str(&format!("Retry-After: {}\r\n", secs));
            }
            head.push_str("\r\n");
            let _ = stream.write_all(format!("{}{}", head, selected.body).as_bytes());
            let _ = stream.flush();
        }
    });
    (format!("http://{}", addr), count)
}

const TOOL_CALL_BODY: &str = r#"{
  "choices": [{
    "finish_reason": "tool_calls",
    "message": {
      "content": null,
      "reasoning_content": "need to list",
      "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "list_files", "arguments": "{\"directory\":\"/tmp\"}"}}]
    }
  }],
  "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
}"#;

#[tokio::test]
async fn test_http_transport_retries_rate_limit_then_parses_tool_call() {
    let (base_url, count) = spawn_mock_server(vec![
        MockHttpResponse {
            status: 429,
            body: r#"{"error":{"message":"slow down"}}"#.to_string(),
            retry_after: Some(0),
        },
        MockHttpResponse {
            status: 200,
            body: TOOL_CALL_BODY.to_string(),
            retry_after: None,
        },
    ]);
    let transport = Arc::new(OpenAiTransport::new(Some(&base_url), Some("test-key")));
    let executor = RequestExecutor::new(transport).with_retry(RetryConfig::new(3, Duration::from_millis(5)));
    let request = ChatCompletionRequest::new("test-model", vec![Message::user("list /tmp")]);

    let response = executor.chat_completion(request, &CancellationToken::new()).await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    let choice = response.first().unwrap();
    assert_eq!(choice.message.tool_calls[0].name, "list_files");
    assert_eq!(choice.message.tool_calls[0].raw_arguments, r#"{"directory":"/tmp"}"#);
    assert_eq!(choice.message.reasoning.as_deref(), Some("need to list"));
    assert_eq!(response.usage.map(|u| (u.prompt_tokens, u.completion_tokens)), Some((12, 5)));
}

#[tokio::test]
async fn test_http_transport_authentication_error_is_not_retried() {
    let (base_url, count) = spawn_mock_server(vec![MockHttpResponse {
        status: 401,
        body: r#"{"error":{"message":"invalid api key"}}"#.to_string(),
        retry_after: None,
    }]);
    let transport = Arc::new(OpenAiTransport::new(Some(&base_url), Some("bad-key")));
    let executor = RequestExecutor::new(transport).with_retry(RetryConfig::new(3, Duration::from_millis(5)));
    let request = ChatCompletionRequest::new("test-model", vec![Message::user("hi")]);

    let err = executor.chat_completion(request, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, LlmError::Authentication(_)));
    assert_eq!(err.status(), Some(401));
    assert!(err.to_string().contains("invalid api key"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
