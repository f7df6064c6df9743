use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{
        CheckoutRequest, OrderList, OrderWithItems, PayOrderRequest, UpdateOrderStatusRequest,
    },
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::{Column as CartCol, Entity as Carts},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{Column as ProdCol, Entity as Products},
        users::Entity as Users,
    },
    error::{AppError, AppResult},
    mailer,
    middleware::auth::{AuthUser, ensure_staff},
    models::{Order, OrderItem},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

const TAX_RATE: Decimal = Decimal::from_parts(15, 0, 0, false, 2); // 0.15
const FREE_SHIPPING_OVER: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
const FLAT_SHIPPING: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Returned,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "shipped" => Some(Self::Shipped),
            "delivered" => Some(Self::Delivered),
            "cancelled" => Some(Self::Cancelled),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Returned => "returned",
        }
    }
}

/// Customers may only cancel or return, and only while the order has not
/// left the pending/processing stage.
fn customer_transition_allowed(current: OrderStatus, requested: OrderStatus) -> AppResult<()> {
    if !matches!(requested, OrderStatus::Cancelled | OrderStatus::Returned) {
        return Err(AppError::Forbidden);
    }
    if !matches!(current, OrderStatus::Pending | OrderStatus::Processing) {
        return Err(AppError::InvalidTransition(format!(
            "cannot {} an order that is already {}",
            requested.as_str(),
            current.as_str()
        )));
    }
    Ok(())
}

/// Derived pricing: 15% tax rounded to cents, flat shipping waived over the
/// free-shipping threshold.
fn compute_totals(items_price: Decimal) -> (Decimal, Decimal, Decimal) {
    let tax_price = (items_price * TAX_RATE).round_dp(2);
    let shipping_price = if items_price > FREE_SHIPPING_OVER {
        Decimal::ZERO
    } else {
        FLAT_SHIPPING
    };
    let total_price = items_price + tax_price + shipping_price;
    (tax_price, shipping_price, total_price)
}

/// Converts the caller's cart into an immutable order snapshot. One
/// transaction covers the whole sequence: a crash can never leave an order
/// without consuming the cart, or vice versa.
pub async fn checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let txn = state.orm.begin().await?;

    let cart = Carts::find()
        .filter(CartCol::UserId.eq(user.user_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::BadRequest("No items in cart".into()))?;

    let cart_items = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .lock(LockType::Update)
        .all(&txn)
        .await?;
    if cart_items.is_empty() {
        return Err(AppError::BadRequest("No items in cart".into()));
    }

    let product_ids: Vec<Uuid> = cart_items.iter().map(|item| item.product_id).collect();
    let products: HashMap<Uuid, _> = Products::find()
        .filter(ProdCol::Id.is_in(product_ids))
        .lock(LockType::Update)
        .all(&txn)
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    // Snapshot every line at this instant; later catalog edits must not
    // retroactively alter the order.
    let mut items_price = Decimal::ZERO;
    let mut lines = Vec::with_capacity(cart_items.len());
    for item in &cart_items {
        let product = products.get(&item.product_id).ok_or(AppError::NotFound)?;
        items_price += product.price * Decimal::from(item.quantity);
        lines.push((
            item.product_id,
            product.name.clone(),
            product.image.clone(),
            product.price,
            item.quantity,
        ));
    }

    let (tax_price, shipping_price, total_price) = compute_totals(items_price);

    let shipping_address = serde_json::to_value(&payload.shipping_address)
        .map_err(|e| AppError::Internal(e.into()))?;

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        shipping_address: Set(shipping_address),
        payment_method: Set(payload.payment_method),
        items_price: Set(items_price),
        tax_price: Set(tax_price),
        shipping_price: Set(shipping_price),
        total_price: Set(total_price),
        is_paid: Set(false),
        paid_at: Set(None),
        payment_result: Set(None),
        is_delivered: Set(false),
        delivered_at: Set(None),
        status: Set(OrderStatus::Pending.as_str().into()),
        created_at: Set(Utc::now().into()),
        updated_at: Set(Utc::now().into()),
    }
    .insert(&txn)
    .await?;

    let mut order_items = Vec::with_capacity(lines.len());
    for (product_id, name, image, price, quantity) in lines {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(product_id),
            name: Set(name),
            image: Set(image),
            price: Set(price),
            quantity: Set(quantity),
            created_at: Set(Utc::now().into()),
        }
        .insert(&txn)
        .await?;
        order_items.push(order_item_from_entity(item));
    }

    // Checkout consumes the whole cart, not just its items.
    Carts::delete_by_id(cart.id).exec(&txn).await?;

    txn.commit().await?;

    match Users::find_by_id(user.user_id).one(&state.orm).await? {
        Some(buyer) => mailer::dispatch_order_confirmation(
            state.mailer.clone(),
            buyer.email,
            order.id,
            order.total_price,
        ),
        None => tracing::warn!(order_id = %order.id, "buyer vanished before confirmation email"),
    }

    if let Err(err) = log_audit(
        state,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order created",
        OrderWithItems {
            order: order_from_entity(order)?,
            items: order_items,
        },
        Some(Meta::empty()),
    ))
}

pub async fn my_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    list_with(state, condition, query).await
}

pub async fn all_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_staff(user)?;
    list_with(state, Condition::all(), query).await
}

async fn list_with(
    state: &AppState,
    mut condition: Condition,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let mut orders = Vec::new();
    for model in finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
    {
        orders.push(order_from_entity(model)?);
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Orders",
        OrderList { items: orders },
        Some(meta),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;

    if order.user_id != user.user_id && !user.is_staff() {
        return Err(AppError::Forbidden);
    }

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems {
            order: order_from_entity(order)?,
            items,
        },
        Some(Meta::empty()),
    ))
}

/// Records a payment gateway result. Restricted to the order's owner or
/// staff; an open route here would let any authenticated user flip someone
/// else's order to paid.
pub async fn pay_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: PayOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    if order.user_id != user.user_id && !user.is_staff() {
        return Err(AppError::Forbidden);
    }
    if order.is_paid {
        return Err(AppError::BadRequest("Order already paid".into()));
    }

    let payment_result =
        serde_json::to_value(&payload).map_err(|e| AppError::Internal(e.into()))?;

    let mut active: OrderActive = order.into();
    active.is_paid = Set(true);
    active.paid_at = Set(Some(Utc::now().into()));
    active.payment_result = Set(Some(payment_result));
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&txn)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    txn.commit().await?;

    if let Err(err) = log_audit(
        state,
        Some(user.user_id),
        "order_paid",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment recorded",
        OrderWithItems {
            order: order_from_entity(order)?,
            items,
        },
        Some(Meta::empty()),
    ))
}

pub async fn deliver_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    ensure_staff(user)?;

    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let mut active: OrderActive = order.into();
    active.is_delivered = Set(true);
    active.delivered_at = Set(Some(Utc::now().into()));
    active.status = Set(OrderStatus::Delivered.as_str().into());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        state,
        Some(user.user_id),
        "order_delivered",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order delivered",
        order_from_entity(order)?,
        Some(Meta::empty()),
    ))
}

pub async fn update_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    let requested = OrderStatus::parse(&payload.status)
        .ok_or_else(|| AppError::BadRequest("Invalid order status".into()))?;

    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    if !user.is_staff() {
        // A customer may only touch their own orders.
        if order.user_id != user.user_id {
            return Err(AppError::Forbidden);
        }
        let current = OrderStatus::parse(&order.status)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown stored status")))?;
        customer_transition_allowed(current, requested)?;
    }

    let mut active: OrderActive = order.into();
    active.status = Set(requested.as_str().into());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        state,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "status": order.status })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order updated",
        order_from_entity(order)?,
        Some(Meta::empty()),
    ))
}

fn order_from_entity(model: OrderModel) -> AppResult<Order> {
    let shipping_address = serde_json::from_value(model.shipping_address)
        .map_err(|e| AppError::Internal(e.into()))?;
    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        shipping_address,
        payment_method: model.payment_method,
        items_price: model.items_price,
        tax_price: model.tax_price,
        shipping_price: model.shipping_price,
        total_price: model.total_price,
        is_paid: model.is_paid,
        paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
        payment_result: model.payment_result,
        is_delivered: model.is_delivered,
        delivered_at: model.delivered_at.map(|dt| dt.with_timezone(&Utc)),
        status: model.status,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        name: model.name,
        image: model.image,
        price: model.price,
        quantity: model.quantity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn totals_above_free_shipping_threshold() {
        // 2 x $30 + 1 x $50 = $110 -> free shipping, 15% tax.
        let (tax, shipping, total) = compute_totals(dec("110"));
        assert_eq!(tax, dec("16.50"));
        assert_eq!(shipping, Decimal::ZERO);
        assert_eq!(total, dec("126.50"));
    }

    #[test]
    fn totals_below_free_shipping_threshold() {
        let (tax, shipping, total) = compute_totals(dec("40"));
        assert_eq!(tax, dec("6.00"));
        assert_eq!(shipping, dec("10"));
        assert_eq!(total, dec("56.00"));
    }

    #[test]
    fn exactly_at_threshold_still_pays_shipping() {
        let (_, shipping, _) = compute_totals(dec("100"));
        assert_eq!(shipping, dec("10"));
    }

    #[test]
    fn tax_rounds_to_cents() {
        // 19.99 * 0.15 = 2.9985 -> 3.00
        let (tax, _, _) = compute_totals(dec("19.99"));
        assert_eq!(tax, dec("3.00"));
    }

    #[test]
    fn customer_may_cancel_pending_or_processing() {
        assert!(customer_transition_allowed(OrderStatus::Pending, OrderStatus::Cancelled).is_ok());
        assert!(
            customer_transition_allowed(OrderStatus::Processing, OrderStatus::Returned).is_ok()
        );
    }

    #[test]
    fn customer_may_not_cancel_shipped_order() {
        let err = customer_transition_allowed(OrderStatus::Shipped, OrderStatus::Cancelled)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[test]
    fn customer_may_not_set_arbitrary_status() {
        let err = customer_transition_allowed(OrderStatus::Pending, OrderStatus::Delivered)
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));
    }

    #[test]
    fn status_round_trips_through_parse() {
        for s in [
            "pending",
            "processing",
            "shipped",
            "delivered",
            "cancelled",
            "returned",
        ] {
            assert_eq!(OrderStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(OrderStatus::parse("refunded").is_none());
    }
}
