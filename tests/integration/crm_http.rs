//! The HTTP CRM client against a mock server.

use crate::integration::test_utils::{settings, sim};
use crmsim::content::TemplateContent;
use crmsim::crm::{
    AssociationInput, AssociationRequest, CrmClient, CrmErrorKind, CrmSettings, FieldMap,
    HttpCrmClient,
};
use crmsim::scheduler::JobManager;
use crmsim::store::{ProgressStore, SledProgressStore};
use crmsim::types::{JobStatus, RecordId, RecordType};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpCrmClient {
    let settings = CrmSettings {
        base_url: server.uri(),
        access_token: Some("pat-test".to_string()),
        ..CrmSettings::default()
    };
    HttpCrmClient::new(&settings).unwrap()
}

fn fields(name: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("firstname".to_string(), json!(name));
    fields
}

#[tokio::test]
async fn create_returns_the_assigned_id_and_sends_the_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/contacts"))
        .and(header("authorization", "Bearer pat-test"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "501" })))
        .expect(1)
        .mount(&server)
        .await;

    let id = client_for(&server)
        .create_record(RecordType::Contact, &fields("Anne"))
        .await
        .unwrap();
    assert_eq!(id, RecordId::new("501"));

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["properties"]["firstname"], "Anne");
}

#[tokio::test]
async fn throttling_carries_the_server_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "2")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let err = client_for(&server)
        .create_record(RecordType::Contact, &fields("Anne"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, CrmErrorKind::RateLimited);
    assert_eq!(err.status, Some(429));
    assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
}

#[tokio::test]
async fn missing_object_endpoint_means_unsupported_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/crm/v3/objects/tasks"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .create_record(RecordType::Task, &FieldMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, CrmErrorKind::UnknownObjectType);
}

fn deal_links(contact_label: &str) -> AssociationRequest {
    AssociationRequest {
        from_type: RecordType::Deal,
        from_id: RecordId::new("301"),
        category: "HUBSPOT_DEFINED".to_string(),
        inputs: vec![
            AssociationInput {
                to_type: RecordType::Contact,
                to_id: RecordId::new("101"),
                association_type: contact_label.to_string(),
            },
            AssociationInput {
                to_type: RecordType::Company,
                to_id: RecordId::new("201"),
                association_type: "deal_to_company".to_string(),
            },
        ],
    }
}

#[tokio::test]
async fn associations_post_one_batch_per_target_type() {
    let server = MockServer::start().await;
    for target in ["contacts", "companies"] {
        Mock::given(method("POST"))
            .and(path(format!("/crm/v4/associations/deals/{}/batch/create", target)))
            .and(header("authorization", "Bearer pat-test"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({ "status": "COMPLETE", "results": [{}] })),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let linked = client_for(&server)
        .create_associations(&deal_links("deal_to_contact"))
        .await
        .unwrap();
    assert_eq!(linked, 2);

    let requests = server.received_requests().await.unwrap();
    let contact = requests
        .iter()
        .find(|r| r.url.path() == "/crm/v4/associations/deals/contacts/batch/create")
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&contact.body).unwrap();
    assert_eq!(body["inputs"].as_array().unwrap().len(), 1);
    assert_eq!(body["inputs"][0]["from"]["id"], "301");
    assert_eq!(body["inputs"][0]["to"]["id"], "101");
    assert_eq!(body["inputs"][0]["types"][0]["associationCategory"], "HUBSPOT_DEFINED");
    assert_eq!(body["inputs"][0]["types"][0]["associationTypeId"], 3);
}

#[tokio::test]
async fn unknown_association_label_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "results": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let request = AssociationRequest {
        inputs: deal_links("deal_to_starship").inputs[..1].to_vec(),
        ..deal_links("deal_to_starship")
    };
    let err = client_for(&server)
        .create_associations(&request)
        .await
        .unwrap_err();
    assert_eq!(err.kind, CrmErrorKind::UnknownObjectType);
}

#[tokio::test]
async fn association_batch_errors_without_results_are_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/crm/v4/associations/deals/\w+/batch/create$"))
        .respond_with(ResponseTemplate::new(207).set_body_json(json!({
            "status": "COMPLETE",
            "results": [],
            "errors": [{ "status": "error", "message": "record 101 not found" }],
        })))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .create_associations(&deal_links("deal_to_contact"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, CrmErrorKind::Validation);
    assert!(err.message.contains("record 101 not found"));
}

#[tokio::test]
async fn job_runs_end_to_end_over_http() {
    let server = MockServer::start().await;
    for (object, id) in [("contacts", "101"), ("companies", "201"), ("deals", "301")] {
        Mock::given(method("POST"))
            .and(path(format!("/crm/v3/objects/{}", object)))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": id })))
            .expect(1)
            .mount(&server)
            .await;
    }
    for target in ["contacts", "companies"] {
        Mock::given(method("POST"))
            .and(path(format!("/crm/v4/associations/deals/{}/batch/create", target)))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "results": [{}] })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn ProgressStore> =
        Arc::new(SledProgressStore::open(dir.path().join("store")).unwrap());
    let manager = JobManager::new(
        store,
        Arc::new(client_for(&server)),
        Arc::new(TemplateContent::default()),
        settings(),
    );
    let id = manager.start_job("alice", sim(1, 1, 1, 0, 0)).unwrap();
    let report = manager.wait(&id).await.unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.steps_succeeded, 4);

    let steps = manager.steps(&id).unwrap();
    let ids: Vec<String> = steps
        .iter()
        .filter_map(|s| s.real_id.as_ref().map(|id| id.to_string()))
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&"301".to_string()));
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}
