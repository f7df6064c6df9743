use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Statement};
use uuid::Uuid;

use storefront_api::{
    db::{connect, run_migrations},
    routes::params::ProductQuery,
    services::product_service,
    state::AppState,
};

// Catalog query semantics: conjunctive filters, case-insensitive keyword,
// inclusive bounds, and fixed ten-item pages.
#[tokio::test]
async fn catalog_filters_and_pagination() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    // Eleven wrenches priced 10..=20, plus three differently shaped products.
    for i in 0..11 {
        seed_product(
            &state,
            &format!("Wrench {i}"),
            "tools",
            Some("hand"),
            Decimal::from(10 + i),
            4.0,
        )
        .await?;
    }
    seed_product(&state, "Gadget Pro", "electronics", Some("audio"), "99.99".parse()?, 4.5).await?;
    seed_product(&state, "Super GADGET", "electronics", Some("video"), "150".parse()?, 3.0).await?;
    seed_product(&state, "cheap gadget", "toys", None, "5".parse()?, 2.0).await?;

    // Unfiltered: fourteen products, ten per page.
    let page = product_service::list_products(&state, query()).await?.data.unwrap();
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.page, 1);
    assert_eq!(page.pages, 2);

    let mut q = query();
    q.page_number = Some(2);
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 4);
    assert_eq!(page.page, 2);

    // Past the last page: empty slice, page count unchanged.
    let mut q = query();
    q.page_number = Some(3);
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.pages, 2);

    // Keyword is a case-insensitive substring match on the name.
    let mut q = query();
    q.keyword = Some("gadget".into());
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.pages, 1);

    // Filters compose conjunctively.
    let mut q = query();
    q.keyword = Some("gadget".into());
    q.category = Some("electronics".into());
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 2);

    let mut q = query();
    q.category = Some("electronics".into());
    q.subcategory = Some("audio".into());
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "Gadget Pro");

    // Price bounds are inclusive on both ends.
    let mut q = query();
    q.min_price = Some(Decimal::from(12));
    q.max_price = Some(Decimal::from(15));
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 4);

    let mut q = query();
    q.min_price = Some(Decimal::from(20));
    q.max_price = Some(Decimal::from(20));
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "Wrench 10");

    // Minimum rating is an inclusive lower bound.
    let mut q = query();
    q.min_rating = Some(4.5);
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].name, "Gadget Pro");

    let mut q = query();
    q.min_rating = Some(4.0);
    let page = product_service::list_products(&state, q).await?.data.unwrap();
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.pages, 2);

    Ok(())
}

fn query() -> ProductQuery {
    ProductQuery {
        keyword: None,
        category: None,
        subcategory: None,
        min_price: None,
        max_price: None,
        min_rating: None,
        page_number: None,
    }
}

async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let orm = connect(&database_url).await?;
    run_migrations(&orm).await?;

    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE order_items, orders, cart_items, carts, reviews, audit_logs, products, users RESTART IDENTITY CASCADE",
    ))
    .await?;

    Ok(Some(AppState { orm, mailer: None }))
}

async fn seed_product(
    state: &AppState,
    name: &str,
    category: &str,
    subcategory: Option<&str>,
    price: Decimal,
    rating: f64,
) -> anyhow::Result<Uuid> {
    let product = storefront_api::entity::products::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(format!("{name} for testing")),
        price: Set(price),
        category: Set(category.to_string()),
        subcategory: Set(subcategory.map(str::to_string)),
        image: Set(None),
        brand: Set(None),
        count_in_stock: Set(10),
        rating: Set(rating),
        num_reviews: Set(if rating > 0.0 { 1 } else { 0 }),
        created_at: Set(chrono::Utc::now().into()),
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}
