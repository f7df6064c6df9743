use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        cart::{CartItemView, CartView},
        orders::{OrderList, OrderWithItems},
        products::ProductPage,
        reviews::{ReviewList, ReviewView},
        users::{UserList, UserView},
    },
    models::{Order, OrderItem, Product, Review, ShippingAddress},
    response::{ApiResponse, Meta},
    routes::{auth, cart, health, orders, params, products, reviews, users},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::register,
        auth::login,
        products::list_products,
        products::get_product,
        products::create_product,
        products::update_product,
        products::delete_product,
        products::list_reviews,
        products::create_review,
        reviews::delete_review,
        cart::get_cart,
        cart::add_item,
        cart::update_item,
        cart::remove_item,
        orders::checkout,
        orders::all_orders,
        orders::my_orders,
        orders::get_order,
        orders::pay_order,
        orders::deliver_order,
        orders::update_status,
        users::list_users,
        users::get_user,
        users::update_user,
        users::delete_user
    ),
    components(
        schemas(
            Product,
            Review,
            Order,
            OrderItem,
            ShippingAddress,
            ProductPage,
            ReviewView,
            ReviewList,
            CartView,
            CartItemView,
            OrderList,
            OrderWithItems,
            UserView,
            UserList,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductPage>,
            ApiResponse<CartView>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<ReviewList>,
            ApiResponse<UserList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Products", description = "Catalog endpoints"),
        (name = "Reviews", description = "Review endpoints"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Checkout and order lifecycle endpoints"),
        (name = "Users", description = "Admin user management"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
