use pageshot::snapshot::RASTER_ATTR;
use pageshot::{Dom, MemoryLoader, NoNetworkLoader, Session, SessionConfig, Severity, Snapshot, SnapshotNode};

fn frame(children: Vec<SnapshotNode>) -> SnapshotNode {
    let mut node = SnapshotNode::element("iframe").with_attr("src", "https://frames.example/inner.html");
    node.props.hidden = true;
    node.children = vec![
        SnapshotNode::doctype("html"),
        SnapshotNode::element("html").with_child(SnapshotNode::element("body").with_children(children)),
    ];
    node
}

fn page(children: Vec<SnapshotNode>) -> Snapshot {
    Snapshot::new(SnapshotNode::element("html").with_child(SnapshotNode::element("body").with_children(children)))
        .with_url("https://site.example/page/")
}

fn frames(dom: &Dom, container: pageshot::NodeId) -> Vec<pageshot::NodeId> {
    dom.descendants(container)
        .into_iter()
        .filter(|n| dom.is_element_named(*n, "iframe"))
        .collect()
}

#[tokio::test]
async fn nested_frames_drain_to_a_fixed_point() {
    let inner = frame(vec![SnapshotNode::element("p").with_child(SnapshotNode::text("deep"))]);
    let outer = frame(vec![inner]);
    let snap = page(vec![outer]);

    let mut session = Session::default();
    let mut dom = Dom::new();
    let container = dom.create_document();
    let report = pageshot::reconstruct(&mut session, &mut dom, &snap, container, &NoNetworkLoader)
        .await
        .unwrap();
    assert_eq!(report.frames_loaded, 2);
    assert_eq!(report.frames_failed, 0);
    assert!(dom.is_visible(container));

    let outer = frames(&dom, container)[0];
    assert_eq!(dom.attribute(outer, "src"), Some("about:blank"));
    let outer_doc = dom.content_document(outer).unwrap();
    let inner = frames(&dom, outer_doc)[0];
    let inner_doc = dom.content_document(inner).unwrap();
    assert_eq!(dom.text_content(inner_doc), "deep");
}

#[tokio::test]
async fn stuck_frames_time_out_and_stay_blank() {
    let snap = page(vec![frame(vec![SnapshotNode::text("never")]), SnapshotNode::element("p")]);
    let config = SessionConfig { subdocument_timeout_ms: 20, ..Default::default() };
    let mut session = Session::new(config).unwrap();
    let mut dom = Dom::new();
    let container = dom.create_document();
    let loader = MemoryLoader::new().stalling_frames();

    let report = pageshot::reconstruct(&mut session, &mut dom, &snap, container, &loader).await.unwrap();
    assert_eq!(report.frames_failed, 1);
    assert!(dom.is_visible(container));
    let frame = frames(&dom, container)[0];
    let doc = dom.content_document(frame).unwrap();
    assert!(dom.children(doc).is_empty());
    assert!(session
        .diagnostics()
        .iter()
        .any(|d| d.severity == Severity::Error && d.message.contains("timed out")));
}

#[tokio::test]
async fn failed_frames_and_assets_settle_instead_of_rejecting() {
    let link = SnapshotNode::element("link").with_attr("rel", "stylesheet").with_attr("href", "missing.css");
    let snap = page(vec![link, frame(vec![])]);
    let mut session = Session::default();
    let mut dom = Dom::new();
    let container = dom.create_document();
    let loader = MemoryLoader::new().with_failing_frame("about:blank");

    let report = pageshot::reconstruct(&mut session, &mut dom, &snap, container, &loader).await.unwrap();
    assert_eq!(report.frames_failed, 1);
    assert_eq!(report.assets_failed, 1);
    assert!(dom.is_visible(container));
    assert_eq!(session.diagnostics().len(), 2);
}

#[tokio::test]
async fn assets_resolve_against_the_snapshot_url_and_canvases_paint() {
    let link = SnapshotNode::element("link").with_attr("rel", "stylesheet").with_attr("href", "../theme.css");
    let canvas = SnapshotNode::element("canvas").with_attr(RASTER_ATTR, "data:image/png;base64,AAEC");
    let broken = SnapshotNode::element("canvas").with_attr(RASTER_ATTR, "data:image/png;base64,***");
    let snap = page(vec![link, canvas, broken]);

    let mut session = Session::default();
    let mut dom = Dom::new();
    let container = dom.create_document();
    let loader = MemoryLoader::new().with_sheet("https://site.example/theme.css", "body { margin: 0 } p { color: red }");

    let report = pageshot::reconstruct(&mut session, &mut dom, &snap, container, &loader).await.unwrap();
    assert_eq!(report.assets_loaded, 1);
    assert_eq!(report.canvases_painted, 1);
    assert_eq!(report.canvases_failed, 1);

    let all = dom.descendants(container);
    let link = *all.iter().find(|n| dom.is_element_named(**n, "link")).unwrap();
    let sheet = dom.element(link).unwrap().sheet.clone().unwrap();
    assert_eq!(sheet.rules.len(), 2);
    let canvas = *all.iter().find(|n| dom.is_element_named(**n, "canvas")).unwrap();
    assert_eq!(dom.element(canvas).unwrap().canvas.as_ref().unwrap().bytes, vec![0, 1, 2]);
}

#[cfg(feature = "http")]
#[tokio::test]
async fn style_sheets_are_fetched_over_http() {
    use tiny_http::{Response, Server};

    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr();
    std::thread::spawn(move || {
        for req in server.incoming_requests() {
            let response = if req.url().ends_with(".css") {
                Response::from_string("h1 { font-weight: 300 }")
            } else {
                Response::from_string("missing").with_status_code(404)
            };
            let _ = req.respond(response);
        }
    });

    let head = SnapshotNode::element("head").with_children([
        SnapshotNode::element("link").with_attr("rel", "stylesheet").with_attr("href", "/a.css"),
        SnapshotNode::element("link").with_attr("rel", "stylesheet").with_attr("href", "/b.css"),
        SnapshotNode::element("link").with_attr("rel", "stylesheet").with_attr("href", "/nope"),
    ]);
    let snap = Snapshot::new(SnapshotNode::element("html").with_child(head)).with_url(&format!("http://{}/", addr));

    let mut session = Session::default();
    let loader = pageshot::HttpLoader::new(&session.config).unwrap();
    let mut dom = Dom::new();
    let container = dom.create_document();
    let report = pageshot::reconstruct(&mut session, &mut dom, &snap, container, &loader).await.unwrap();
    assert_eq!(report.assets_loaded, 2);
    assert_eq!(report.assets_failed, 1);
}
