use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::reviews::{CreateReviewRequest, ReviewList, ReviewView},
    entity::{
        products::{ActiveModel as ProductActive, Entity as Products, Model as ProductModel},
        reviews::{ActiveModel as ReviewActive, Column as ReviewCol, Entity as Reviews},
        users::Entity as Users,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::Review,
    response::{ApiResponse, Meta},
    state::AppState,
};

pub async fn add_review(
    state: &AppState,
    user: &AuthUser,
    product_id: Uuid,
    payload: CreateReviewRequest,
) -> AppResult<ApiResponse<Review>> {
    if !(1..=5).contains(&payload.rating) {
        return Err(AppError::BadRequest(
            "rating must be between 1 and 5".to_string(),
        ));
    }

    let txn = state.orm.begin().await?;

    // Lock the product row so concurrent review writes serialize their
    // aggregate recomputation.
    let product = Products::find_by_id(product_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let already = Reviews::find()
        .filter(ReviewCol::ProductId.eq(product_id))
        .filter(ReviewCol::UserId.eq(user.user_id))
        .one(&txn)
        .await?;
    if already.is_some() {
        return Err(AppError::Conflict(
            "Product already reviewed by this user".to_string(),
        ));
    }

    let review = ReviewActive {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        user_id: Set(user.user_id),
        rating: Set(payload.rating),
        comment: Set(payload.comment),
        created_at: Set(Utc::now().into()),
    }
    .insert(&txn)
    .await?;

    recompute_aggregates(&txn, product).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        state,
        Some(user.user_id),
        "review_add",
        Some("reviews"),
        Some(serde_json::json!({ "product_id": product_id, "review_id": review.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Review added",
        review_from_entity(review),
        Some(Meta::empty()),
    ))
}

pub async fn delete_review(
    state: &AppState,
    user: &AuthUser,
    review_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let txn = state.orm.begin().await?;

    let review = Reviews::find_by_id(review_id)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    if review.user_id != user.user_id && !user.is_admin() {
        return Err(AppError::Forbidden);
    }

    let product = Products::find_by_id(review.product_id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    review.delete(&txn).await?;
    recompute_aggregates(&txn, product).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        state,
        Some(user.user_id),
        "review_delete",
        Some("reviews"),
        Some(serde_json::json!({ "review_id": review_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Review removed",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn list_reviews(
    state: &AppState,
    product_id: Uuid,
) -> AppResult<ApiResponse<ReviewList>> {
    let rows = Reviews::find()
        .filter(ReviewCol::ProductId.eq(product_id))
        .order_by_desc(ReviewCol::CreatedAt)
        .find_also_related(Users)
        .all(&state.orm)
        .await?;

    let items = rows
        .into_iter()
        .map(|(review, user)| ReviewView {
            id: review.id,
            product_id: review.product_id,
            user_id: review.user_id,
            user_name: user.map(|u| u.name).unwrap_or_default(),
            rating: review.rating,
            comment: review.comment,
            created_at: review.created_at.with_timezone(&Utc),
        })
        .collect();

    Ok(ApiResponse::success("Reviews", ReviewList { items }, None))
}

/// Recomputes the denormalized rating/count from the full review set. Always
/// runs in the same transaction as the review change, with the product row
/// held under lock.
async fn recompute_aggregates<C: ConnectionTrait>(
    conn: &C,
    product: ProductModel,
) -> AppResult<()> {
    let ratings: Vec<i32> = Reviews::find()
        .filter(ReviewCol::ProductId.eq(product.id))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.rating)
        .collect();

    let num_reviews = ratings.len() as i32;
    let rating = if ratings.is_empty() {
        0.0
    } else {
        ratings.iter().map(|&r| f64::from(r)).sum::<f64>() / ratings.len() as f64
    };

    let mut active: ProductActive = product.into();
    active.num_reviews = Set(num_reviews);
    active.rating = Set(rating);
    active.update(conn).await?;

    Ok(())
}

fn review_from_entity(model: crate::entity::reviews::Model) -> Review {
    Review {
        id: model.id,
        product_id: model.product_id,
        user_id: model.user_id,
        rating: model.rating,
        comment: model.comment,
        created_at: model.created_at.with_timezone(&Utc),
    }
}
