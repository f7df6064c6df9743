use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Statement};
use uuid::Uuid;

use storefront_api::{
    db::{connect, run_migrations},
    dto::cart::{AddToCartRequest, UpdateCartItemRequest},
    error::AppError,
    middleware::auth::AuthUser,
    services::cart_service,
    state::AppState,
};

// Cart line management: merge-on-add, quantity updates against stock, and
// removal by line id.
#[tokio::test]
async fn cart_add_update_remove_flow() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let user = auth_user(create_user(&state, "customer", "cart@example.com").await?, "customer");
    let product_id = create_product(&state, "Mug", "12.50".parse()?, 4).await?;

    // No stored cart yet: the view is empty rather than missing.
    let cart = cart_service::get_cart(&state, &user).await?.data.unwrap();
    assert!(cart.items.is_empty());
    assert_eq!(cart.user_id, user.user_id);

    let err = cart_service::add_item(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 0,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    let err = cart_service::add_item(
        &state,
        &user,
        AddToCartRequest {
            product_id: Uuid::new_v4(),
            quantity: 1,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound));

    // Adding the same product twice merges into one line.
    cart_service::add_item(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await?;
    let cart = cart_service::add_item(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 1,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].quantity, 3);

    // Merging past stock is rejected, even though each add alone would fit.
    let err = cart_service::add_item(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock));

    let item_id = cart.items[0].id;
    let err = cart_service::update_item_quantity(
        &state,
        &user,
        item_id,
        UpdateCartItemRequest { quantity: 9 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock));

    let cart = cart_service::update_item_quantity(
        &state,
        &user,
        item_id,
        UpdateCartItemRequest { quantity: 4 },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(cart.items[0].quantity, 4);

    // Another user's line id is invisible to this cart.
    let other = auth_user(create_user(&state, "customer", "other@example.com").await?, "customer");
    let err = cart_service::remove_item(&state, &other, item_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound));

    let cart = cart_service::remove_item(&state, &user, item_id)
        .await?
        .data
        .unwrap();
    assert!(cart.items.is_empty());

    let err = cart_service::remove_item(&state, &user, item_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound));

    Ok(())
}

fn auth_user(user_id: Uuid, role: &str) -> AuthUser {
    AuthUser {
        user_id,
        role: role.into(),
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

async fn create_user(state: &AppState, role: &str, email: &str) -> anyhow::Result<Uuid> {
    let user = storefront_api::entity::users::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(email.split('@').next().unwrap_or("user").to_string()),
        email: Set(email.to_string()),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: Set(chrono::Utc::now().into()),
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: Decimal,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = storefront_api::entity::products::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        description: Set(format!("{name} for testing")),
        price: Set(price),
        category: Set("test".into()),
        subcategory: Set(None),
        image: Set(None),
        brand: Set(None),
        count_in_stock: Set(stock),
        rating: Set(0.0),
        num_reviews: Set(0),
        created_at: Set(chrono::Utc::now().into()),
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}
