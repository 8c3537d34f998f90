//! Named fixtures resolved over an in-memory page

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{as_page, FakePage};
use kit_e2e::kit::{self, ClickNav, InView, APP, CLICKNAV, IN_VIEW, JAVASCRIPT_ENABLED, PAGE, READ_ERRORS};
use kit_e2e::page::BoundingBox;
use kit_e2e::readiness::START_MARKER_SCRIPT;
use kit_e2e::{
    AppBridge, E2eError, ErrorTable, FixtureRegistry, GotoOptions, NavigablePage, ReadinessPolicy,
    ServerMode, SharedPage,
};

fn registry(fake: &Arc<FakePage>, mode: ServerMode) -> FixtureRegistry {
    let page = as_page(fake);
    let javascript_enabled = fake.javascript_enabled;
    kit::base_fixtures(javascript_enabled, move || {
        let page = page.clone();
        async move { Ok(page) }
    })
    .extend(kit::kit_layer(
        ReadinessPolicy::for_mode(mode),
        Arc::new(ErrorTable::default()),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_page_is_instrumented_and_closed() {
    let fake = FakePage::new(true).shared();

    registry(&fake, ServerMode::Build)
        .run(&[PAGE], |f| async move {
            let page: SharedPage = f.get(PAGE)?;
            page.goto("/a").await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(
        fake.calls(),
        vec![
            format!("add_init_script {}", START_MARKER_SCRIPT),
            "goto /a".to_string(),
            "wait_for_selector body.started".to_string(),
            "close".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_page_without_javascript_has_no_init_script() {
    let fake = FakePage::new(false).shared();

    registry(&fake, ServerMode::Dev)
        .run(&[PAGE, JAVASCRIPT_ENABLED], |f| async move {
            assert!(!f.get::<bool>(JAVASCRIPT_ENABLED)?);
            let page: SharedPage = f.get(PAGE)?;
            page.goto("/a").await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(fake.calls(), vec!["goto /a", "close"]);
}

#[tokio::test]
async fn test_app_calls_router_entry_points() {
    let fake = FakePage::new(true).shared();

    registry(&fake, ServerMode::Build)
        .run(&[APP], |f| async move {
            let app: AppBridge = f.get(APP)?;
            let options = GotoOptions { replace_state: true, ..Default::default() };
            app.goto("/b", &options).await?;
            app.prefetch_routes(&["/c", "/d"]).await?;
            app.before_navigate("({ to }) => to.pathname !== '/e'").await?;
            Ok(())
        })
        .await
        .unwrap();

    let calls = fake.calls();
    assert!(calls.contains(&r#"evaluate (async () => { await goto("/b", {"replaceState":true}); })()"#.to_string()));
    assert!(calls.contains(&r#"evaluate (async () => { await prefetchRoutes(["/c","/d"]); })()"#.to_string()));
    assert!(calls.contains(
        &"evaluate (async () => { await beforeNavigate(({ to }) => to.pathname !== '/e'); })()".to_string()
    ));
}

#[tokio::test]
async fn test_verify_contract_reports_missing_globals() {
    let mut fake = FakePage::new(true);
    fake.evaluate_result = json!(["prefetchRoutes"]);
    let fake = fake.shared();

    let err = AppBridge::new(as_page(&fake)).verify_contract().await.unwrap_err();
    assert!(matches!(err, E2eError::MissingEntryPoints(ref missing) if missing == &["prefetchRoutes"]));
}

#[tokio::test(start_paused = true)]
async fn test_clicknav_waits_for_navigation_only_with_javascript() {
    for javascript_enabled in [true, false] {
        let fake = FakePage::new(javascript_enabled).shared();

        registry(&fake, ServerMode::Build)
            .run(&[CLICKNAV], |f| async move {
                let clicknav: ClickNav = f.get(CLICKNAV)?;
                clicknav.click("a[href='/next']").await
            })
            .await
            .unwrap();

        assert!(fake.called("click a[href='/next']"));
        assert_eq!(fake.called("wait_for_navigation"), javascript_enabled);
    }
}

#[tokio::test]
async fn test_in_view() {
    let mut fake = FakePage::new(true);
    fake.boxes.insert("#top".into(), BoundingBox { x: 0.0, y: 10.0, width: 50.0, height: 20.0 });
    fake.boxes.insert("#below".into(), BoundingBox { x: 0.0, y: 2000.0, width: 50.0, height: 20.0 });
    let fake = fake.shared();

    registry(&fake, ServerMode::Build)
        .run(&[IN_VIEW], |f| async move {
            let in_view: InView = f.get(IN_VIEW)?;
            assert!(in_view.check("#top").await?);
            assert!(!in_view.check("#below").await?);
            assert!(!in_view.check("#absent").await?);
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_read_errors_shares_table() {
    let fake = FakePage::new(true).shared();

    let table = registry(&fake, ServerMode::Build)
        .run(&[READ_ERRORS], |f| async move { f.get::<Arc<ErrorTable>>(READ_ERRORS) })
        .await
        .unwrap();
    assert!(table.is_empty());
}
