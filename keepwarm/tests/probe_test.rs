use std::thread::JoinHandle;
use std::time::Duration;

use keepwarm::probe::Prober;
use keepwarm::{Milestone, RunLog};
use tiny_http::{Header, Response, Server};

/// Answers one request with `status` and returns the headers it received.
fn serve_once(status: u16, location: Option<&'static str>) -> (String, JoinHandle<Vec<(String, String)>>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", server.server_addr().to_ip().unwrap());
    let handle = std::thread::spawn(move || {
        let request = server.recv().unwrap();
        let headers = request
            .headers()
            .iter()
            .map(|h| (h.field.to_string(), h.value.to_string()))
            .collect();
        let mut response = Response::from_string("body").with_status_code(status);
        if let Some(location) = location {
            response = response.with_header(Header::from_bytes("Location", location).unwrap());
        }
        request.respond(response).unwrap();
        headers
    });
    (url, handle)
}

fn prober() -> Prober {
    Prober::with_timeout(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn status_200_is_direct_access() {
    let (url, handle) = serve_once(200, None);
    let mut log = RunLog::new();

    assert!(prober().check(&url, "a.b.c", &mut log).await);
    assert!(log.has_milestone(Milestone::DirectAccess));

    let headers = handle.join().unwrap();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };
    assert_eq!(header("Cookie").as_deref(), Some("WorkstationJwtPartitioned=a.b.c"));
    assert_eq!(header("Accept-Language").as_deref(), Some("en-US"));
    assert_eq!(
        header("Referer").as_deref(),
        Some("https://workstations.cloud.google.com/")
    );
    assert!(header("User-Agent").unwrap().contains("iPhone"));
}

#[tokio::test]
async fn redirect_to_sign_in_is_not_reachable() {
    let (url, handle) = serve_once(302, Some("https://accounts.google.com/"));
    let mut log = RunLog::new();

    assert!(!prober().check(&url, "a.b.c", &mut log).await);
    assert!(!log.has_milestone(Milestone::DirectAccess));
    assert!(log.contains("Probe status: 302"));
    handle.join().unwrap();
}

#[tokio::test]
async fn server_error_is_not_reachable() {
    let (url, handle) = serve_once(500, None);
    let mut log = RunLog::new();

    assert!(!prober().check(&url, "a.b.c", &mut log).await);
    assert!(log.contains("Status 500"));
    handle.join().unwrap();
}

#[tokio::test]
async fn transport_errors_are_not_reachable() {
    // Bind and drop to get a port nothing listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut log = RunLog::new();

    assert!(
        !prober()
            .check(&format!("http://127.0.0.1:{port}/"), "a.b.c", &mut log)
            .await
    );
    assert!(log.contains("Probe request failed"));
}
