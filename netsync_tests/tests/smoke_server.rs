use netsync_server::server::bind_ephemeral;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(60).await?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.tick(), 3);
    Ok(())
}

#[tokio::test]
async fn console_reports_status() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(60).await?;
    server.step(1.0 / 60.0).await?;

    let out = server.exec_console("status");
    assert_eq!(out[0], "Tick: 1");
    assert_eq!(out[2], "Clients: 0");
    assert_eq!(server.exec_console("goal 2"), vec!["Goal for team 2".to_string()]);
    assert_eq!(server.exec_console("status")[1], "Score: 0 - 1");
    assert!(server.exec_console("teleport")[0].starts_with("Unknown command"));
    assert!(server.exec_console("   ").is_empty());
    Ok(())
}
