use harvest_core::CandidateDescriptor;
use harvest_sources::{
    workflow_search_query, ContentSource, GitHubClient, SearchIndex, SourceError,
};
use harvest_storage::HttpClientConfig;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, token: Option<&str>) -> GitHubClient {
    GitHubClient::new(server.uri(), token, HttpClientConfig::default()).expect("client")
}

fn candidate(content_ref: String) -> CandidateDescriptor {
    CandidateDescriptor {
        source_repo: "octo/widgets".into(),
        path: ".github/workflows/ci.yml".into(),
        content_ref,
        display_url: "https://github.com/octo/widgets/blob/main/.github/workflows/ci.yml".into(),
    }
}

#[tokio::test]
async fn search_sends_query_paging_and_token() {
    let server = MockServer::start().await;
    let query = workflow_search_query(Some("stars:>10"));

    Mock::given(method("GET"))
        .and(path("/search/code"))
        .and(query_param("q", query.as_str()))
        .and(query_param("per_page", "50"))
        .and(query_param("page", "2"))
        .and(header("authorization", "token s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_count": 2,
            "items": [
                {
                    "path": ".github/workflows/ci.yml",
                    "url": "https://api.github.com/repos/octo/widgets/contents/.github/workflows/ci.yml",
                    "html_url": "https://github.com/octo/widgets/blob/main/.github/workflows/ci.yml",
                    "repository": { "full_name": "octo/widgets" }
                },
                {
                    "path": ".github/workflows/release.yaml",
                    "url": "https://api.github.com/repos/octo/gears/contents/.github/workflows/release.yaml",
                    "repository": { "full_name": "octo/gears" }
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let search = client(&server, Some("s3cret")).code_search(query.clone(), 50);
    let page = search.next_page(2).await.expect("page");

    assert_eq!(page.len(), 2);
    assert_eq!(page[0].identity(), "octo/widgets:.github/workflows/ci.yml");
    assert_eq!(page[1].identity(), "octo/gears:.github/workflows/release.yaml");
    assert_eq!(page[1].display_url, page[1].content_ref);
}

#[tokio::test]
async fn empty_items_signal_end_of_results() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .mount(&server)
        .await;

    let search = client(&server, None).code_search(workflow_search_query(None), 100);
    assert!(search.next_page(1).await.expect("page").is_empty());
}

#[tokio::test]
async fn forbidden_search_is_reported_as_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/code"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-reset", "1767225600")
                .set_body_string("API rate limit exceeded"),
        )
        .mount(&server)
        .await;

    let search = client(&server, None).code_search(workflow_search_query(None), 100);
    match search.next_page(1).await {
        Err(SourceError::RateLimited(message)) => assert!(message.contains("1767225600")),
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn server_error_is_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search/code"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let search = client(&server, None).code_search(workflow_search_query(None), 100);
    assert!(matches!(
        search.next_page(1).await,
        Err(SourceError::Transport(_))
    ));
}

#[tokio::test]
async fn contents_are_decoded_from_base64() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/octo/widgets/contents/ci.yml"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "encoding": "base64",
            "content": "bmFtZTogQ0kK\nb246IHB1c2gK\n"
        })))
        .mount(&server)
        .await;

    let contents = client(&server, None).contents();
    let text = contents
        .fetch(&candidate(format!(
            "{}/repos/octo/widgets/contents/ci.yml",
            server.uri()
        )))
        .await
        .expect("fetch");
    assert_eq!(text.as_deref(), Some("name: CI\non: push\n"));
}

#[tokio::test]
async fn missing_or_empty_contents_are_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.yml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/empty.yml"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": "" })))
        .mount(&server)
        .await;

    let contents = client(&server, None).contents();
    let gone = contents
        .fetch(&candidate(format!("{}/gone.yml", server.uri())))
        .await
        .expect("404 is not an error");
    let empty = contents
        .fetch(&candidate(format!("{}/empty.yml", server.uri())))
        .await
        .expect("empty");
    assert!(gone.is_none());
    assert!(empty.is_none());
}
