// Recorded DuckDuckGo pages under fixtures/duckduckgo/sample parse into the expected hits.

use std::path::{Path, PathBuf};

use aqx_adapters::{extract_detail, load_fixture_bundle, parse_result_links};

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/duckduckgo/sample")
}

#[test]
fn recorded_results_page_yields_hits_in_page_order() {
    let html = std::fs::read_to_string(sample_dir().join("results.html")).expect("results.html");
    let base = "https://html.duckduckgo.com/html/?q=limpieza+de+piscina+lima";
    let links = parse_result_links(&html, base, 30).expect("parse results");

    let urls = links.iter().map(|l| l.url.as_str()).collect::<Vec<_>>();
    assert_eq!(
        urls,
        vec![
            "https://foro.pe/piscinas/mantenimiento-la-molina",
            "https://x.pe/a",
            "https://blog.pe/piscina-verano",
        ]
    );
    assert_eq!(links[1].title, "Necesito ayuda con limpieza de piscina");
}

#[test]
fn recorded_detail_page_yields_body_and_date() {
    let html = std::fs::read_to_string(sample_dir().join("detail.html")).expect("detail.html");
    let detail = extract_detail(&html);

    let body = detail.body.expect("body");
    assert!(body.starts_with("Inicio · Foros · Hogar ¿Alguien sabe"));
    assert!(body.contains("Quiero una cotización para el verano"));
    assert!(!body.contains("dataLayer"));
    assert!(!body.contains("Activa JavaScript"));
    assert_eq!(
        detail.published_at.map(|ts| ts.to_rfc3339()),
        Some("2026-10-12T14:15:00+00:00".to_string())
    );
}

#[test]
fn sample_bundle_covers_duplicate_and_malformed_hits() {
    let bundle = load_fixture_bundle(sample_dir().join("bundle.json")).expect("bundle");
    assert_eq!(bundle.source_id, "duckduckgo");
    assert!(bundle.items.iter().any(|i| i.title.trim().is_empty()));
    let first = &bundle.items[0];
    let first_id = aqx_core::post_id(&first.title, &first.url);
    assert!(bundle
        .items
        .iter()
        .skip(1)
        .any(|i| aqx_core::post_id(&i.title, &i.url) == first_id));
}
