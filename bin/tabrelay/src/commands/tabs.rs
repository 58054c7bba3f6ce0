use tabrelay_agent::{Browser, CdpBrowser, StateStore};
use tabrelay_core::{Config, Paths};

pub async fn run(cdp_port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let port = cdp_port.unwrap_or(config.agent.cdp_port);

    let pages = CdpBrowser::new(port).list_pages().await?;
    let state = StateStore::new(paths.agent_state_file()).load().await?;

    if pages.is_empty() {
        println!("No open pages on port {}.", port);
        return Ok(());
    }

    println!("{:<16} {:<3} {}", "TAB ID", "", "URL / TITLE");
    for page in pages {
        let marker = if state.active_tab_id == Some(page.id) {
            "*"
        } else if state.is_attached(page.id) {
            "+"
        } else {
            ""
        };
        println!("{:<16} {:<3} {}", page.id, marker, page.url);
        if !page.title.is_empty() {
            println!("{:<16} {:<3} {}", "", "", page.title);
        }
    }
    println!();
    println!("+ attached   * active");
    Ok(())
}
