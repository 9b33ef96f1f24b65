use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::phpser::PhpValue;
use crate::store::SiteStore;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MenuSummary {
    pub term_id: i64,
    pub name: String,
    pub slug: String,
    pub item_count: usize,
    pub locations: Vec<String>,
}

pub fn list_menus(store: &SiteStore) -> Result<Vec<MenuSummary>> {
    let locations = menu_locations(store)?;
    Ok(store
        .list_menus()?
        .into_iter()
        .map(|menu| MenuSummary {
            locations: locations.get(&menu.term_id).cloned().unwrap_or_default(),
            term_id: menu.term_id,
            name: menu.name,
            slug: menu.slug,
            item_count: menu.item_count,
        })
        .collect())
}

/// Theme location names keyed by assigned menu term id, read from the active
/// theme's `theme_mods_<stylesheet>` option.
fn menu_locations(store: &SiteStore) -> Result<BTreeMap<i64, Vec<String>>> {
    let mut out: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    let Some(stylesheet) = store.get_option("stylesheet")? else {
        debug!("no active stylesheet option; menu locations unavailable");
        return Ok(out);
    };
    let option = format!("theme_mods_{}", stylesheet.trim());
    let Some(mods) = store.get_serialized_option(&option)? else {
        return Ok(out);
    };
    let Some(PhpValue::Array(entries)) = mods.get("nav_menu_locations") else {
        return Ok(out);
    };
    for (location, value) in entries {
        if let Some(term_id) = value.as_int().filter(|id| *id > 0) {
            out.entry(term_id).or_default().push(location.as_display());
        }
    }
    Ok(out)
}
